//! One end of a logical connection between two hosts.
//!
//! A peer is created in a connecting state by [`crate::host::Host::connect`]
//! (outbound) or [`crate::host::Host::accept`] (inbound), moves to connected
//! when the handshake completes, and reaches its terminal state through
//! exactly one [`crate::events::PeerListener::on_disconnect`] call - whether
//! by local disconnect, remote disconnect, ack timeout, rejection or
//! disposal.

pub(crate) mod fragments;
pub(crate) mod inbound;
pub(crate) mod ordering;
pub(crate) mod outbound;

pub use outbound::SentMessage;

use crate::config::PeerConfig;
use crate::crypto::{KeyExchange, PacketCipher, Signer};
use crate::error::TransportError;
use crate::events::{ConnectionRequest, DisconnectReason, PeerListener};
use crate::host::PeerContext;
use crate::message::OutgoingMessage;
use crate::message_header::MessageFlags;
use crate::packet_header::{PacketFlags, PacketHeader, PacketType};
use crate::statistics::Statistics;
use crate::ticks;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use fragments::FragmentReassembly;
use ordering::OrderingEngine;
use outbound::OutboundState;
use rustc_hash::{FxHashMap, FxHashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Per-channel `u16` counters (send sequences, receive sequences,
/// unsequenced runs), one slot per channel.
pub(crate) struct ChannelCounters([AtomicU16; 256]);

impl ChannelCounters {
    fn new() -> ChannelCounters {
        ChannelCounters(std::array::from_fn(|_| AtomicU16::new(0)))
    }

    pub(crate) fn load(&self, channel: u8) -> u16 {
        self.0[channel as usize].load(Ordering::Relaxed)
    }

    /// Increment modulo 2^16 and return the new value.
    pub(crate) fn bump(&self, channel: u8) -> u16 {
        self.0[channel as usize]
            .fetch_add(1, Ordering::Relaxed)
            .wrapping_add(1)
    }

    pub(crate) fn store(&self, channel: u8, value: u16) {
        self.0[channel as usize].store(value, Ordering::Relaxed)
    }

    pub(crate) fn slot(&self, channel: u8) -> &AtomicU16 {
        &self.0[channel as usize]
    }
}

struct HandshakeState {
    key_exchange: Option<Box<dyn KeyExchange>>,
    cipher: Option<Arc<dyn PacketCipher>>,
    /// Random bytes we sent in our REQUEST, awaiting the remote's signature.
    challenge: Bytes,
    /// Cached REQUEST (outbound) for the connect retry loop.
    request_packet: Option<Bytes>,
    /// Cached ACCEPT (inbound) so duplicate REQUESTs can be answered again.
    accept_packet: Option<Bytes>,
    pinger: Option<JoinHandle<()>>,
}

impl HandshakeState {
    fn new() -> HandshakeState {
        HandshakeState {
            key_exchange: None,
            cipher: None,
            challenge: Bytes::new(),
            request_packet: None,
            accept_packet: None,
            pinger: None,
        }
    }
}

pub struct Peer {
    remote: SocketAddr,
    pub(crate) config: PeerConfig,
    pub(crate) listener: Arc<dyn PeerListener>,
    pub(crate) ctx: PeerContext,
    pub(crate) statistics: Arc<Statistics>,

    /// Collapsing this token cancels every task the peer ever spawned:
    /// resenders, pinger, flush, fragment timeout, dedup eviction and
    /// ordered-delay waits all run under child tokens.
    pub(crate) dispose_token: CancellationToken,
    connected: AtomicBool,
    disposed: AtomicBool,

    rtt_ms: AtomicU16,
    time_delta: AtomicU16,
    pub(crate) has_time_delta: AtomicBool,

    pub(crate) send_sequences: ChannelCounters,
    pub(crate) receive_sequences: ChannelCounters,
    pub(crate) unsequenced_runs: ChannelCounters,
    pub(crate) fragment_ids: AtomicU16,

    handshake: Mutex<HandshakeState>,
    pub(crate) outbound: Mutex<OutboundState>,
    pub(crate) reliables: Mutex<FxHashMap<(u8, u16), Arc<SentMessage>>>,
    pub(crate) duplicates: Mutex<FxHashSet<(u8, u16)>>,
    pub(crate) fragments: Mutex<FragmentReassembly>,
    pub(crate) ordering: OrderingEngine,
}

impl Peer {
    fn new(
        ctx: PeerContext,
        remote: SocketAddr,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
    ) -> Arc<Peer> {
        Arc::new(Peer {
            remote,
            config,
            listener,
            ctx,
            statistics: Arc::new(Statistics::default()),
            dispose_token: CancellationToken::new(),
            connected: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            rtt_ms: AtomicU16::new(0),
            time_delta: AtomicU16::new(0),
            has_time_delta: AtomicBool::new(false),
            send_sequences: ChannelCounters::new(),
            receive_sequences: ChannelCounters::new(),
            unsequenced_runs: ChannelCounters::new(),
            fragment_ids: AtomicU16::new(0),
            handshake: Mutex::new(HandshakeState::new()),
            outbound: Mutex::new(OutboundState::new()),
            reliables: Mutex::new(FxHashMap::default()),
            duplicates: Mutex::new(FxHashSet::default()),
            fragments: Mutex::new(FragmentReassembly::new()),
            ordering: OrderingEngine::new(),
        })
    }

    /// Initiating side: register the peer, then keep sending REQUESTs until
    /// an ACCEPT or REJECT arrives or the attempts run out.
    pub(crate) async fn connect(
        ctx: PeerContext,
        remote: SocketAddr,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
        connect_payload: Option<Bytes>,
    ) -> anyhow::Result<Arc<Peer>> {
        let encryption = ctx.encryption;
        let peer = Peer::new(ctx, remote, config, listener);

        let request_packet = {
            let mut handshake = peer.handshake.lock().unwrap();

            let exchange_key = if encryption {
                let key_exchange = peer.ctx.crypto.new_key_exchange();
                let public = key_exchange.public_key();
                handshake.key_exchange = Some(key_exchange);
                public
            } else {
                Vec::new()
            };

            let challenge = if peer.config.remote_public_key.is_some() {
                let mut random = vec![0u8; 32];
                peer.ctx.crypto.random_bytes(&mut random);
                Bytes::from(random)
            } else {
                Bytes::new()
            };
            handshake.challenge = challenge.clone();

            let packet = peer.handshake_packet(
                PacketType::Request,
                &exchange_key,
                &challenge,
                connect_payload.as_deref().unwrap_or(&[]),
            );
            handshake.request_packet = Some(packet.clone());
            packet
        };

        peer.ctx.registry.insert(peer.clone());

        let retry_peer = peer.clone();
        tokio::spawn(async move {
            for attempt in 0..retry_peer.config.connect_attempts {
                if retry_peer.is_connected() || retry_peer.is_disposed() {
                    return;
                }
                trace!("sending connect request {} to {:?}", attempt, retry_peer.remote);
                retry_peer.send_datagram(&request_packet).await;

                tokio::select! {
                    _ = retry_peer.dispose_token.cancelled() => return,
                    _ = tokio::time::sleep(retry_peer.config.connect_delay) => {}
                }
            }
            if !retry_peer.is_connected() {
                debug!("connect to {:?} ran out of attempts", retry_peer.remote);
                retry_peer
                    .terminate(DisconnectReason::Timeout, None, Some(TransportError::Timeout))
                    .await;
            }
        });

        Ok(peer)
    }

    /// Accepting side: reciprocate a pending request with an ACCEPT carrying
    /// our exchange key and the signature over the initiator's challenge.
    pub(crate) async fn accept(
        ctx: PeerContext,
        request: &ConnectionRequest,
        config: PeerConfig,
        listener: Arc<dyn PeerListener>,
        signer: &Arc<dyn Signer>,
    ) -> anyhow::Result<Arc<Peer>> {
        let encryption = ctx.encryption;
        let peer = Peer::new(ctx, request.remote(), config, listener);

        let accept_packet = {
            let mut handshake = peer.handshake.lock().unwrap();

            let exchange_key = if encryption && request.encrypted() {
                let key_exchange = peer.ctx.crypto.new_key_exchange();
                let public = key_exchange.public_key();
                handshake.cipher = Some(Arc::from(key_exchange.derive(request.exchange_key())?));
                public
            } else {
                Vec::new()
            };

            let signature = if request.authenticate() {
                signer.sign(request.random())
            } else {
                Vec::new()
            };

            let packet =
                peer.handshake_packet(PacketType::Accept, &exchange_key, &signature, &[]);
            handshake.accept_packet = Some(packet.clone());
            packet
        };

        peer.ctx.registry.insert(peer.clone());
        peer.send_datagram(&accept_packet).await;

        peer.connected.store(true, Ordering::Release);
        peer.start_pinger();
        peer.listener.on_connect(peer.clone()).await;
        Ok(peer)
    }

    /// `REQUEST`/`ACCEPT` packet: `u16` key length, `u16` random length, the
    /// two segments, then an optional application payload.
    fn handshake_packet(
        &self,
        packet_type: PacketType,
        key: &[u8],
        random: &[u8],
        payload: &[u8],
    ) -> Bytes {
        let flags = if self.ctx.crc32 { PacketFlags::VERIFIED } else { PacketFlags::empty() };
        let header = PacketHeader::new(packet_type, flags);

        let mut buf = BytesMut::with_capacity(
            header.serialized_len() + 4 + key.len() + random.len() + payload.len(),
        );
        header.ser(&mut buf);
        buf.put_u16_le(key.len() as u16);
        buf.put_u16_le(random.len() as u16);
        buf.put_slice(key);
        buf.put_slice(random);
        buf.put_slice(payload);

        PacketHeader::patch_crc(&mut buf);
        buf.freeze()
    }

    /// The remote reciprocated our REQUEST: verify its signature over our
    /// challenge, derive the session cipher, and go connected.
    pub(crate) async fn handle_accept(self: &Arc<Self>, payload: &[u8]) {
        if self.is_connected() || self.is_disposed() {
            trace!("ignoring duplicate accept from {:?}", self.remote);
            return;
        }

        let (key, signature, _rest) = match parse_handshake_segments(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.report_exception(e).await;
                return;
            }
        };

        let result = {
            let mut handshake = self.handshake.lock().unwrap();

            let verification = match &self.config.remote_public_key {
                Some(remote_key) => {
                    self.ctx.crypto.verify(remote_key, &handshake.challenge, &signature)
                }
                None => Ok(()),
            };

            verification.and_then(|()| {
                if let (Some(key_exchange), false) =
                    (handshake.key_exchange.take(), key.is_empty())
                {
                    handshake.cipher = Some(Arc::from(key_exchange.derive(&key)?));
                }
                handshake.request_packet = None;
                Ok(())
            })
        };

        match result {
            Ok(()) => {
                self.connected.store(true, Ordering::Release);
                self.start_pinger();
                self.listener.on_connect(self.clone()).await;
            }
            Err(TransportError::BadSignature) => {
                warn!("accept from {:?} failed signature verification", self.remote);
                self.terminate(
                    DisconnectReason::BadSignature,
                    None,
                    Some(TransportError::BadSignature),
                )
                .await;
            }
            Err(e) => {
                self.terminate(DisconnectReason::Exception, None, Some(e)).await;
            }
        }
    }

    /// REJECT during the handshake disposes the peer and hands the remote's
    /// opaque payload to the listener. On an established connection it is an
    /// anomaly (possibly spoofed) and only surfaces as an exception.
    pub(crate) async fn handle_reject(self: &Arc<Self>, payload: &[u8]) {
        if self.is_connected() {
            warn!("reject from already connected {:?}", self.remote);
            self.report_exception(TransportError::Rejected).await;
            return;
        }
        self.terminate(
            DisconnectReason::Rejected,
            Some(Bytes::copy_from_slice(payload)),
            Some(TransportError::Rejected),
        )
        .await;
    }

    /// The initiator did not see our ACCEPT and resent its REQUEST.
    pub(crate) async fn handle_duplicate_request(self: &Arc<Self>) {
        let packet = self.handshake.lock().unwrap().accept_packet.clone();
        match packet {
            Some(packet) => {
                debug!("re-answering duplicate request from {:?}", self.remote);
                self.send_datagram(&packet).await;
            }
            None => trace!("duplicate request on initiating side ignored"),
        }
    }

    fn start_pinger(self: &Arc<Self>) {
        let peer = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = peer.dispose_token.cancelled() => return,
                    _ = tokio::time::sleep(peer.config.ping_delay) => {}
                }
                if !peer.is_connected() {
                    return;
                }
                peer.send_ping().await;
            }
        });
        self.handshake.lock().unwrap().pinger = Some(handle);
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.remote
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Smoothed round-trip time of the connection, sampled from
    /// first-attempt acknowledgements.
    pub fn rtt_ms(&self) -> u16 {
        self.rtt_ms.load(Ordering::Relaxed)
    }

    /// Low-16-bit clock skew of the remote's millisecond clock against ours.
    pub fn time_delta(&self) -> u16 {
        self.time_delta.load(Ordering::Relaxed)
    }

    /// Current estimate of inbound messages lost in transit.
    pub fn lost_messages(&self) -> u64 {
        self.statistics.message_receive_lost()
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub(crate) fn update_rtt(&self, rtt: u16, delta: u16) {
        self.rtt_ms.store(rtt, Ordering::Relaxed);
        self.time_delta.store(delta, Ordering::Relaxed);
        self.has_time_delta.store(true, Ordering::Relaxed);
    }

    /// Lift a remote `created_ticks` slice onto our own clock, once the
    /// clock skew is known.
    pub(crate) fn reconstruct_created(&self, created_ticks: u16) -> Option<u64> {
        if !self.has_time_delta.load(Ordering::Relaxed) {
            return None;
        }
        let local_slice = created_ticks.wrapping_sub(self.time_delta());
        Some(ticks::reconstruct_near(self.ctx.clock.now_ms(), local_slice))
    }

    pub(crate) fn cipher(&self) -> Option<Arc<dyn PacketCipher>> {
        self.handshake.lock().unwrap().cipher.clone()
    }

    /// Announce the disconnect to the remote, then tear down after the
    /// configured grace period.
    pub async fn disconnect(self: &Arc<Self>) {
        if self.is_disposed() {
            return;
        }
        debug!("disconnecting from {:?}", self.remote);
        self.send_disconnect_notice().await;

        tokio::select! {
            _ = self.dispose_token.cancelled() => {}
            _ = tokio::time::sleep(self.config.disconnect_delay) => {}
        }
        self.terminate(DisconnectReason::Disconnected, None, None).await;
    }

    /// Immediate teardown without notifying the remote. Idempotent.
    pub async fn dispose(self: &Arc<Self>) {
        self.terminate(DisconnectReason::Disposed, None, None).await;
    }

    /// The single exit point of the state machine. Exactly one call wins;
    /// it cancels every outstanding task, unregisters the peer and fires the
    /// one terminal listener callback.
    pub(crate) async fn terminate(
        self: &Arc<Self>,
        reason: DisconnectReason,
        payload: Option<Bytes>,
        error: Option<TransportError>,
    ) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("peer {:?} terminating: {:?}", self.remote, reason);

        self.connected.store(false, Ordering::Release);
        self.dispose_token.cancel();

        {
            let mut handshake = self.handshake.lock().unwrap();
            if let Some(pinger) = handshake.pinger.take() {
                pinger.abort();
            }
        }
        {
            let mut outbound = self.outbound.lock().unwrap();
            if let Some(flush) = outbound.flush_task.take() {
                flush.abort();
            }
        }
        self.reliables.lock().unwrap().clear();
        self.ctx.registry.remove(self.remote);

        self.listener
            .on_disconnect(self.clone(), payload, reason, error)
            .await;
    }

    /// Per-message/per-packet failures are isolated: report and carry on.
    pub(crate) async fn report_exception(self: &Arc<Self>, error: TransportError) {
        debug!("exception on peer {:?}: {}", self.remote, error);
        self.listener.on_exception(self.clone(), error).await;
    }

    /// Raw datagram out, with send statistics. Socket errors are isolated
    /// per datagram and reported through the exception hook.
    pub(crate) async fn send_datagram(self: &Arc<Self>, packet: &[u8]) {
        self.statistics.add_packets_sent(1);
        self.statistics.add_bytes_sent(packet.len() as u64);
        self.ctx.host_statistics.add_packets_sent(1);
        self.ctx.host_statistics.add_bytes_sent(packet.len() as u64);

        if let Err(e) = self.ctx.socket.send_packet(self.remote, packet).await {
            self.report_exception(TransportError::Io(e)).await;
        }
    }

    /// Queue an application message for sending. Returns a handle that can
    /// be polled for acknowledgement.
    pub async fn send(
        self: &Arc<Self>,
        message: OutgoingMessage,
    ) -> Result<Arc<SentMessage>, TransportError> {
        if self.is_disposed() {
            return Err(TransportError::Disposed);
        }
        self.send_message(crate::message_header::MessageType::Custom, message).await
    }
}

/// A connected peer wired to an arbitrary socket, for pipeline tests.
#[cfg(test)]
pub(crate) fn test_peer(
    socket: Arc<dyn crate::host::SendSocket>,
    config: PeerConfig,
    listener: Arc<dyn PeerListener>,
    crc32: bool,
) -> Arc<Peer> {
    let ctx = PeerContext {
        socket,
        clock: Arc::new(crate::ticks::Clock::new()),
        allocator: Arc::new(crate::buffers::Allocator::new(16, 2048, 2048, 8192, 1 << 20)),
        host_statistics: Arc::new(Statistics::default()),
        registry: Arc::new(crate::host::PeerRegistry::new()),
        crypto: Arc::new(crate::crypto::DefaultCrypto),
        compressor: None,
        crc32,
        encryption: false,
        max_packet_length: 1 << 20,
    };
    let peer = Peer::new(ctx, "127.0.0.1:9".parse().unwrap(), config, listener);
    peer.connected.store(true, Ordering::Release);
    peer
}

/// Split a `REQUEST`/`ACCEPT` payload into its key, random/signature and
/// trailing application segments.
pub(crate) fn parse_handshake_segments(
    payload: &[u8],
) -> Result<(Bytes, Bytes, Bytes), TransportError> {
    let mut buf = payload;
    let key_len = buf
        .try_get_u16_le()
        .map_err(|_| TransportError::malformed("truncated handshake key length"))? as usize;
    let random_len = buf
        .try_get_u16_le()
        .map_err(|_| TransportError::malformed("truncated handshake random length"))?
        as usize;

    if buf.remaining() < key_len + random_len {
        return Err(TransportError::Malformed(format!(
            "handshake segments of {} bytes exceed payload of {}",
            key_len + random_len,
            buf.remaining()
        )));
    }

    let key = Bytes::copy_from_slice(&buf[..key_len]);
    let random = Bytes::copy_from_slice(&buf[key_len..key_len + random_len]);
    let rest = Bytes::copy_from_slice(&buf[key_len + random_len..]);
    Ok((key, random, rest))
}

impl MessageFlags {
    /// Reliable messages always ship a sequence so the ack can name them.
    pub(crate) fn needs_sequence(&self) -> bool {
        self.intersects(MessageFlags::RELIABLE | MessageFlags::ORDERED | MessageFlags::UNIQUE)
    }
}
