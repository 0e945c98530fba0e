//! The process-wide owner of one UDP socket and its peers.
//!
//! The host binds the socket, runs the receive loop(s), dispatches datagrams
//! by their leading type byte - handshake requests to the listener,
//! connectionless traffic to its hooks, everything else to the peer mapped
//! to the sender - and owns the shared resources (allocator, clock, crypto
//! capabilities, statistics) the peers work with.

use crate::compress::Compressor;
use crate::config::{HostConfig, PeerConfig};
use crate::crypto::{CryptoProvider, Signer};
use crate::error::TransportError;
use crate::events::{ConnectionRequest, DisconnectReason, HostListener, PeerListener};
use crate::message::OutgoingMessage;
use crate::packet_header::{PacketFlags, PacketHeader, PacketType};
use crate::peer::{parse_handshake_segments, Peer};
use crate::statistics::Statistics;
use crate::ticks::Clock;
use anyhow::bail;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
#[cfg(test)]
use mockall::automock;
use rustc_hash::FxHashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::buffers::Allocator;

/// Sending seam over the UDP socket, mockable for peer-level tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SendSocket: Send + Sync + 'static {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> io::Result<()>;

    fn local_addr(&self) -> SocketAddr;
}

#[async_trait]
impl SendSocket for Arc<UdpSocket> {
    async fn send_packet(&self, to: SocketAddr, packet: &[u8]) -> io::Result<()> {
        trace!("sending {} bytes to {:?}", packet.len(), to);
        self.send_to(packet, to).await.map(|_| ())
    }

    fn local_addr(&self) -> SocketAddr {
        self.as_ref()
            .local_addr()
            .expect("a bound UdpSocket has a local addr")
    }
}

/// The endpoint-to-peer map, shared between the host and its peers so a
/// disposing peer can unregister itself.
pub(crate) struct PeerRegistry {
    peers: RwLock<FxHashMap<SocketAddr, Arc<Peer>>>,
}

impl PeerRegistry {
    pub(crate) fn new() -> PeerRegistry {
        PeerRegistry { peers: RwLock::new(FxHashMap::default()) }
    }

    pub(crate) fn get(&self, remote: &SocketAddr) -> Option<Arc<Peer>> {
        self.peers.read().unwrap().get(remote).cloned()
    }

    pub(crate) fn contains(&self, remote: &SocketAddr) -> bool {
        self.peers.read().unwrap().contains_key(remote)
    }

    pub(crate) fn insert(&self, peer: Arc<Peer>) {
        self.peers.write().unwrap().insert(peer.remote_endpoint(), peer);
    }

    pub(crate) fn remove(&self, remote: SocketAddr) {
        self.peers.write().unwrap().remove(&remote);
    }

    pub(crate) fn all(&self) -> Vec<Arc<Peer>> {
        self.peers.read().unwrap().values().cloned().collect()
    }

    fn drain(&self) -> Vec<Arc<Peer>> {
        self.peers.write().unwrap().drain().map(|(_, peer)| peer).collect()
    }
}

/// The host-owned resources a peer needs: there is no back-pointer from a
/// peer to its host, only to these.
#[derive(Clone)]
pub(crate) struct PeerContext {
    pub(crate) socket: Arc<dyn SendSocket>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) host_statistics: Arc<Statistics>,
    pub(crate) registry: Arc<PeerRegistry>,
    pub(crate) crypto: Arc<dyn CryptoProvider>,
    pub(crate) compressor: Option<Arc<dyn Compressor>>,
    pub(crate) crc32: bool,
    pub(crate) encryption: bool,
    pub(crate) max_packet_length: usize,
}

struct HostInner {
    config: HostConfig,
    socket: Arc<UdpSocket>,
    send_socket: Arc<dyn SendSocket>,
    clock: Arc<Clock>,
    allocator: Arc<Allocator>,
    listener: Arc<dyn HostListener>,
    registry: Arc<PeerRegistry>,
    statistics: Arc<Statistics>,
    signer: Arc<dyn Signer>,
    shutdown_token: CancellationToken,
    disposed: AtomicBool,
}

pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Bind the socket and start the receive loop(s).
    pub async fn new(config: HostConfig, listener: Arc<dyn HostListener>) -> anyhow::Result<Host> {
        config.validate()?;

        let bind_addr: SocketAddr = if config.dual_mode {
            (IpAddr::from(Ipv6Addr::UNSPECIFIED), config.port).into()
        } else {
            (IpAddr::from(Ipv4Addr::UNSPECIFIED), config.port).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        if config.broadcast {
            socket.set_broadcast(true)?;
        }
        info!("bound host socket to {:?}", socket.local_addr());

        let allocator = Arc::new(Allocator::new(
            config.allocator_count,
            config.allocator_pooled_length,
            config.allocator_pooled_expand_length,
            config.allocator_expand_length,
            config.allocator_max_length,
        ));
        let signer: Arc<dyn Signer> =
            Arc::from(config.crypto.new_signer(config.private_key.as_ref()));

        let inner = Arc::new(HostInner {
            socket: socket.clone(),
            send_socket: Arc::new(socket),
            clock: Arc::new(Clock::new()),
            allocator,
            listener,
            registry: Arc::new(PeerRegistry::new()),
            statistics: Arc::new(Statistics::default()),
            signer,
            shutdown_token: CancellationToken::new(),
            disposed: AtomicBool::new(false),
            config,
        });

        for _ in 0..inner.config.receive_count {
            let inner = inner.clone();
            tokio::spawn(async move { inner.receive_loop().await });
        }

        Ok(Host { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.send_socket.local_addr()
    }

    /// Identity key other hosts may pin as their `remote_public_key`.
    pub fn signer_public_key(&self) -> Vec<u8> {
        self.inner.signer.public_key()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.inner.statistics
    }

    /// Open a connection to `remote`. The returned peer is in its connecting
    /// state; the listener's `on_connect` fires when the handshake
    /// completes.
    pub async fn connect(
        &self,
        remote: SocketAddr,
        peer_config: PeerConfig,
        peer_listener: Arc<dyn PeerListener>,
        connect_payload: Option<Bytes>,
    ) -> anyhow::Result<Arc<Peer>> {
        if self.inner.disposed.load(Ordering::Acquire) {
            bail!(TransportError::Disposed);
        }
        peer_config.validate()?;

        let remote = canonical(remote);
        if self.inner.registry.contains(&remote) {
            bail!("a peer for {:?} is already registered", remote);
        }

        Peer::connect(
            self.inner.peer_context(),
            remote,
            peer_config,
            peer_listener,
            connect_payload,
        )
        .await
    }

    /// Reciprocate a pending inbound request.
    pub async fn accept(
        &self,
        request: &ConnectionRequest,
        peer_config: PeerConfig,
        peer_listener: Arc<dyn PeerListener>,
    ) -> anyhow::Result<Arc<Peer>> {
        if self.inner.disposed.load(Ordering::Acquire) {
            bail!(TransportError::Disposed);
        }
        if request.is_disposed() {
            bail!("connection request from {:?} is already settled", request.remote());
        }
        peer_config.validate()?;

        if self.inner.registry.contains(&request.remote()) {
            bail!("a peer for {:?} is already registered", request.remote());
        }

        request.dispose();
        Peer::accept(
            self.inner.peer_context(),
            request,
            peer_config,
            peer_listener,
            &self.inner.signer,
        )
        .await
    }

    /// Turn a pending request down, with an optional opaque payload the
    /// initiator receives in its `on_disconnect`.
    pub async fn reject(
        &self,
        request: &ConnectionRequest,
        payload: Option<Bytes>,
    ) -> Result<(), TransportError> {
        if !request.dispose() {
            return Ok(());
        }
        debug!("rejecting connection request from {:?}", request.remote());

        let packet = self
            .inner
            .connectionless_packet(PacketType::Reject, payload.as_deref().unwrap_or(&[]));
        self.inner.send_to(request.remote(), &packet).await
    }

    /// Fan a message out to every connected peer except `excluded`.
    pub async fn send_all(&self, message: OutgoingMessage, excluded: &[SocketAddr]) {
        for peer in self.inner.registry.all() {
            if excluded.contains(&peer.remote_endpoint()) || !peer.is_connected() {
                continue;
            }
            if let Err(e) = peer.send(message.clone()).await {
                debug!("send_all skipped {:?}: {}", peer.remote_endpoint(), e);
            }
        }
    }

    /// Fire-and-forget datagram to an arbitrary endpoint, outside any
    /// connection.
    pub async fn send_unconnected(
        &self,
        remote: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        let packet = self.inner.connectionless_packet(PacketType::Unconnected, payload);
        self.inner.send_to(canonical(remote), &packet).await
    }

    /// Fire-and-forget datagram to the IPv4 broadcast address.
    pub async fn send_broadcast(&self, port: u16, payload: &[u8]) -> Result<(), TransportError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            return Err(TransportError::Disposed);
        }
        if !self.inner.config.broadcast {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "host configured without broadcast",
            )));
        }
        let packet = self.inner.connectionless_packet(PacketType::Broadcast, payload);
        self.inner
            .send_to((Ipv4Addr::BROADCAST, port).into(), &packet)
            .await
    }

    /// Gracefully disconnect every peer, then notify the listener and stop
    /// the receive loops.
    pub async fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("host {:?} shutting down", self.local_addr());

        let mut disconnects = JoinSet::new();
        for peer in self.inner.registry.drain() {
            disconnects.spawn(async move { peer.disconnect().await });
        }
        while disconnects.join_next().await.is_some() {}

        self.inner.listener.on_shutdown().await;
        self.inner.shutdown_token.cancel();
    }

    /// Immediate teardown: peers get their terminal callback with
    /// [`DisconnectReason::Disposed`], nothing is sent to the remotes.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("host {:?} disposed", self.local_addr());

        self.inner.shutdown_token.cancel();
        for peer in self.inner.registry.drain() {
            peer.terminate(DisconnectReason::Disposed, None, None).await;
        }
    }
}

impl HostInner {
    fn peer_context(&self) -> PeerContext {
        PeerContext {
            socket: self.send_socket.clone(),
            clock: self.clock.clone(),
            allocator: self.allocator.clone(),
            host_statistics: self.statistics.clone(),
            registry: self.registry.clone(),
            crypto: self.config.crypto.clone(),
            compressor: self.config.compression.then(|| self.config.compressor.clone()),
            crc32: self.config.crc32,
            encryption: self.config.encryption,
            max_packet_length: self.config.allocator_max_length,
        }
    }

    /// An UNCONNECTED / BROADCAST / REJECT packet: header plus raw payload.
    fn connectionless_packet(&self, packet_type: PacketType, payload: &[u8]) -> BytesMut {
        let flags =
            if self.config.crc32 { PacketFlags::VERIFIED } else { PacketFlags::empty() };
        let header = PacketHeader::new(packet_type, flags);

        let mut packet = BytesMut::with_capacity(header.serialized_len() + payload.len());
        header.ser(&mut packet);
        packet.put_slice(payload);
        PacketHeader::patch_crc(&mut packet);
        packet
    }

    async fn send_to(&self, remote: SocketAddr, packet: &[u8]) -> Result<(), TransportError> {
        self.statistics.add_packets_sent(1);
        self.statistics.add_bytes_sent(packet.len() as u64);
        self.send_socket.send_packet(remote, packet).await?;
        Ok(())
    }

    async fn receive_loop(self: Arc<Self>) {
        debug!("starting receive loop");
        let mut buf = self.allocator.byte_buffer(self.config.receive_mtu);
        buf.resize(self.config.receive_mtu, 0);

        loop {
            let received = tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                received = self.socket.recv_from(&mut buf[..]) => received,
            };

            let (length, from) = match received {
                Ok(ok) => ok,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    // ICMP port-unreachable feedback: a per-datagram
                    // condition, the socket stays usable
                    self.listener.on_exception(None, TransportError::Io(e)).await;
                    continue;
                }
                Err(e) => {
                    error!("socket receive error: {}", e);
                    self.listener.on_exception(None, TransportError::Io(e)).await;
                    continue;
                }
            };

            let from = canonical(from);
            self.statistics.add_packets_received(1);
            self.statistics.add_bytes_received(length as u64);

            self.dispatch_datagram(from, &buf[..length]).await;
        }
        debug!("receive loop stopped");
    }

    /// Route one datagram by its leading type byte.
    async fn dispatch_datagram(&self, from: SocketAddr, datagram: &[u8]) {
        if datagram.is_empty() {
            self.listener
                .on_exception(Some(from), TransportError::malformed("empty datagram"))
                .await;
            return;
        }

        let packet_type = PacketType::try_from(datagram[0] & 0b0000_0111).ok();

        if let Some(peer) = self.registry.get(&from) {
            match packet_type {
                Some(
                    PacketType::Request
                    | PacketType::Accept
                    | PacketType::Reject
                    | PacketType::Connected,
                ) => {
                    peer.on_receive(datagram).await;
                    return;
                }
                _ => {}
            }
        }

        match packet_type {
            Some(PacketType::Request) => self.handle_request(from, datagram).await,
            Some(PacketType::Unconnected) => match self.strip_header(from, datagram).await {
                Some(payload) => self.listener.on_receive_unconnected(from, payload).await,
                None => {}
            },
            Some(PacketType::Broadcast) => match self.strip_header(from, datagram).await {
                Some(payload) => self.listener.on_receive_broadcast(from, payload).await,
                None => {}
            },
            _ => {
                // CONNECTED / ACCEPT / REJECT without a peer, or an unknown
                // tag: hand the raw bytes to the socket hook
                trace!("unattributed datagram from {:?}", from);
                self.listener
                    .on_receive_socket(from, Bytes::copy_from_slice(datagram))
                    .await;
            }
        }
    }

    async fn handle_request(&self, from: SocketAddr, datagram: &[u8]) {
        let Some(payload) = self.strip_header(from, datagram).await else {
            return;
        };

        match parse_handshake_segments(&payload) {
            Ok((key, random, connect_payload)) => {
                debug!(
                    "connection request from {:?} (encrypted: {}, authenticate: {})",
                    from,
                    !key.is_empty(),
                    !random.is_empty()
                );
                let request =
                    ConnectionRequest::new(from, key, random, connect_payload.clone());
                self.listener.on_receive_request(request, connect_payload).await;
            }
            Err(e) => {
                warn!("malformed connection request from {:?}: {}", from, e);
                self.listener.on_exception(Some(from), e).await;
            }
        }
    }

    /// Parse and strip the packet header of a connectionless datagram,
    /// reporting and swallowing malformed ones.
    async fn strip_header(&self, from: SocketAddr, datagram: &[u8]) -> Option<Bytes> {
        let mut buf = datagram;
        match PacketHeader::deser(&mut buf, self.config.crc32) {
            Ok(_) => Some(Bytes::copy_from_slice(buf)),
            Err(e) => {
                self.listener.on_exception(Some(from), e).await;
                None
            }
        }
    }
}

/// Map v4-in-v6 addresses of dual-stack sockets back to their IPv4 form so
/// peers are keyed consistently.
fn canonical(addr: SocketAddr) -> SocketAddr {
    SocketAddr::new(addr.ip().to_canonical(), addr.port())
}
