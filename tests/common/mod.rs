//! Shared harness for the end-to-end tests: event-recording listeners, a
//! connect/accept helper wiring two in-process hosts together, and a UDP
//! relay that can drop, duplicate, or hold back datagrams.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use peerlink::events::ConnectionRequest;
use peerlink::message::MessageInfo;
use peerlink::{
    DisconnectReason, Host, HostConfig, HostListener, Peer, PeerConfig, PeerListener,
    TransportError,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug)]
pub enum PeerEvent {
    Connect,
    Disconnect(DisconnectReason, Option<Bytes>),
    Receive(Bytes, MessageInfo),
    Rtt(u16),
    Exception(TransportError),
}

pub struct RecordingPeerListener(mpsc::UnboundedSender<PeerEvent>);

#[async_trait]
impl PeerListener for RecordingPeerListener {
    async fn on_connect(&self, _peer: Arc<Peer>) {
        let _ = self.0.send(PeerEvent::Connect);
    }

    async fn on_disconnect(
        &self,
        _peer: Arc<Peer>,
        payload: Option<Bytes>,
        reason: DisconnectReason,
        _error: Option<TransportError>,
    ) {
        let _ = self.0.send(PeerEvent::Disconnect(reason, payload));
    }

    async fn on_receive(&self, _peer: Arc<Peer>, payload: Bytes, info: MessageInfo) {
        let _ = self.0.send(PeerEvent::Receive(payload, info));
    }

    async fn on_update_rtt(&self, _peer: Arc<Peer>, rtt_ms: u16) {
        let _ = self.0.send(PeerEvent::Rtt(rtt_ms));
    }

    async fn on_exception(&self, _peer: Arc<Peer>, error: TransportError) {
        let _ = self.0.send(PeerEvent::Exception(error));
    }
}

pub fn peer_listener() -> (Arc<RecordingPeerListener>, mpsc::UnboundedReceiver<PeerEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingPeerListener(tx)), rx)
}

#[derive(Debug)]
pub enum HostEvent {
    Request(ConnectionRequest, Bytes),
    Unconnected(SocketAddr, Bytes),
    Broadcast(SocketAddr, Bytes),
    Socket(SocketAddr, Bytes),
    Exception(Option<SocketAddr>, TransportError),
    Shutdown,
}

pub struct RecordingHostListener(mpsc::UnboundedSender<HostEvent>);

#[async_trait]
impl HostListener for RecordingHostListener {
    async fn on_receive_request(&self, request: ConnectionRequest, payload: Bytes) {
        let _ = self.0.send(HostEvent::Request(request, payload));
    }

    async fn on_receive_unconnected(&self, remote: SocketAddr, payload: Bytes) {
        let _ = self.0.send(HostEvent::Unconnected(remote, payload));
    }

    async fn on_receive_broadcast(&self, remote: SocketAddr, payload: Bytes) {
        let _ = self.0.send(HostEvent::Broadcast(remote, payload));
    }

    async fn on_receive_socket(&self, remote: SocketAddr, datagram: Bytes) {
        let _ = self.0.send(HostEvent::Socket(remote, datagram));
    }

    async fn on_exception(&self, remote: Option<SocketAddr>, error: TransportError) {
        let _ = self.0.send(HostEvent::Exception(remote, error));
    }

    async fn on_shutdown(&self) {
        let _ = self.0.send(HostEvent::Shutdown);
    }
}

pub fn host_listener() -> (Arc<RecordingHostListener>, mpsc::UnboundedReceiver<HostEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingHostListener(tx)), rx)
}

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Next event, failing the test if none arrives in time.
pub async fn next_event<E: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<E>) -> E {
    timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

/// Skip over events until `select` yields a value.
pub async fn wait_for<E, T>(
    rx: &mut mpsc::UnboundedReceiver<E>,
    mut select: impl FnMut(E) -> Option<T>,
) -> T
where
    E: std::fmt::Debug,
{
    loop {
        let event = next_event(rx).await;
        if let Some(value) = select(event) {
            return value;
        }
    }
}

/// Test peer config: quick handshake and resends, pinger effectively off so
/// traffic assertions see only the test's own messages.
pub fn quiet_peer_config() -> PeerConfig {
    PeerConfig {
        ping_delay: Duration::from_secs(3600),
        send_delay: Duration::from_millis(5),
        connect_delay: Duration::from_millis(100),
        resend_delay_min: Duration::from_millis(100),
        resend_delay_max: Duration::from_millis(400),
        ..PeerConfig::default()
    }
}

/// A connected pair of in-process hosts. `peer_a` is the initiating side.
pub struct Pair {
    pub host_a: Host,
    pub host_b: Host,
    pub peer_a: Arc<Peer>,
    pub peer_b: Arc<Peer>,
    pub events_a: mpsc::UnboundedReceiver<PeerEvent>,
    pub events_b: mpsc::UnboundedReceiver<PeerEvent>,
    pub host_events_a: mpsc::UnboundedReceiver<HostEvent>,
}

pub type RelayRuleFn = Box<dyn Fn(bool, usize) -> RelayRule + Send + Sync>;

/// Wire two hosts together: `host_b` auto-accepts the first request with
/// `config_b`. With a `relay` rule, A dials through a manipulating relay
/// instead of talking to B directly.
pub async fn connect_pair_via(
    host_config_a: HostConfig,
    host_config_b: HostConfig,
    config_a: PeerConfig,
    config_b: PeerConfig,
    relay: Option<RelayRuleFn>,
) -> Pair {
    let (listener_a, host_events_a) = host_listener();
    let (listener_b, mut host_events_b) = host_listener();

    let host_a = Host::new(host_config_a, listener_a).await.expect("host a");
    let host_b = Host::new(host_config_b, listener_b).await.expect("host b");

    let (peer_listener_a, mut events_a) = peer_listener();
    let (peer_listener_b, mut events_b) = peer_listener();

    let target = match relay {
        Some(rule) => spawn_relay(local_addr_of(&host_b), move |to_target, index| {
            rule(to_target, index)
        })
        .await,
        None => local_addr_of(&host_b),
    };
    let peer_a = host_a
        .connect(target, config_a, peer_listener_a, None)
        .await
        .expect("connect");

    let request = wait_for(&mut host_events_b, |event| match event {
        HostEvent::Request(request, _) => Some(request),
        _ => None,
    })
    .await;
    let peer_b = host_b
        .accept(&request, config_b, peer_listener_b)
        .await
        .expect("accept");

    wait_for(&mut events_a, |event| matches!(event, PeerEvent::Connect).then_some(())).await;
    wait_for(&mut events_b, |event| matches!(event, PeerEvent::Connect).then_some(())).await;

    Pair { host_a, host_b, peer_a, peer_b, events_a, events_b, host_events_a }
}

pub async fn connect_pair(config_a: PeerConfig, config_b: PeerConfig) -> Pair {
    connect_pair_via(
        HostConfig { encryption: false, ..HostConfig::default() },
        HostConfig { encryption: false, ..HostConfig::default() },
        config_a,
        config_b,
        None,
    )
    .await
}

pub async fn connect_pair_relayed(
    config_a: PeerConfig,
    config_b: PeerConfig,
    rule: impl Fn(bool, usize) -> RelayRule + Send + Sync + 'static,
) -> Pair {
    connect_pair_via(
        HostConfig { encryption: false, ..HostConfig::default() },
        HostConfig { encryption: false, ..HostConfig::default() },
        config_a,
        config_b,
        Some(Box::new(rule)),
    )
    .await
}

/// The Ed25519 public key a host with this `private_key` seed will sign
/// with, for pinning in `remote_public_key`.
pub fn signer_public_key(seed: [u8; 32]) -> [u8; 32] {
    use peerlink::crypto::{CryptoProvider, DefaultCrypto, Signer as _};
    DefaultCrypto.new_signer(Some(&seed)).public_key().try_into().unwrap()
}

pub fn local_addr_of(host: &Host) -> SocketAddr {
    let addr = host.local_addr();
    // hosts bind the wildcard address; dial loopback on the same port
    let ip = if addr.is_ipv4() { "127.0.0.1".parse().unwrap() } else { "::1".parse().unwrap() };
    SocketAddr::new(ip, addr.port())
}

/// What the relay does with each datagram, per direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayRule {
    Forward,
    Drop,
    Duplicate,
    /// Forward after the given delay, out of band.
    Hold(Duration),
}

/// A single-client UDP forwarder sitting between an initiator and a target
/// host, applying a rule per datagram.
///
/// `rule(to_target, index)` is called with the direction and a per-direction
/// datagram counter.
pub async fn spawn_relay(
    target: SocketAddr,
    rule: impl Fn(bool, usize) -> RelayRule + Send + Sync + 'static,
) -> SocketAddr {
    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.expect("relay bind"));
    let relay_addr = socket.local_addr().unwrap();
    let rule = Arc::new(rule);

    tokio::spawn(async move {
        let mut buf = vec![0u8; 65536];
        let mut client: Option<SocketAddr> = None;
        let mut to_target_count = 0usize;
        let mut to_client_count = 0usize;

        loop {
            let Ok((length, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let datagram = buf[..length].to_vec();

            let (destination, rule_result) = if from == target {
                let Some(client) = client else { continue };
                let result = rule(false, to_client_count);
                to_client_count += 1;
                (client, result)
            } else {
                client = Some(from);
                let result = rule(true, to_target_count);
                to_target_count += 1;
                (target, result)
            };

            match rule_result {
                RelayRule::Drop => {}
                RelayRule::Forward => {
                    let _ = socket.send_to(&datagram, destination).await;
                }
                RelayRule::Duplicate => {
                    let _ = socket.send_to(&datagram, destination).await;
                    let _ = socket.send_to(&datagram, destination).await;
                }
                RelayRule::Hold(delay) => {
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = socket.send_to(&datagram, destination).await;
                    });
                }
            }
        }
    });

    relay_addr
}
