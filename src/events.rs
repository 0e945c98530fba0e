//! Listener contracts and handshake intake types.

use crate::error::TransportError;
use crate::message::MessageInfo;
use crate::peer::Peer;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)]
use mockall::automock;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a peer reached its terminal state. Exactly one
/// [`PeerListener::on_disconnect`] fires per peer lifetime.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DisconnectReason {
    /// We initiated the disconnect.
    Disconnected,
    /// The remote announced its disconnect.
    Terminated,
    /// A reliable message or the handshake ran out of attempts.
    Timeout,
    /// The remote rejected our connection request.
    Rejected,
    /// The remote's handshake signature did not verify.
    BadSignature,
    /// An unrecoverable error tore the peer down.
    Exception,
    /// The peer was disposed locally without a handshake.
    Disposed,
}

/// An inbound REQUEST surfaced by the host's receive loop, waiting for the
/// application to [`crate::host::Host::accept`] or
/// [`crate::host::Host::reject`] it.
#[derive(Clone, Debug)]
pub struct ConnectionRequest {
    remote: SocketAddr,
    exchange_key: Bytes,
    random: Bytes,
    payload: Bytes,
    disposed: Arc<AtomicBool>,
}

impl ConnectionRequest {
    pub(crate) fn new(
        remote: SocketAddr,
        exchange_key: Bytes,
        random: Bytes,
        payload: Bytes,
    ) -> ConnectionRequest {
        ConnectionRequest {
            remote,
            exchange_key,
            random,
            payload,
            disposed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Whether the initiator offered an exchange key, i.e. asks for an
    /// encrypted connection.
    pub fn encrypted(&self) -> bool {
        !self.exchange_key.is_empty()
    }

    /// Whether the initiator sent a challenge it expects us to sign.
    pub fn authenticate(&self) -> bool {
        !self.random.is_empty()
    }

    /// The application payload the initiator attached to its request.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    pub(crate) fn exchange_key(&self) -> &Bytes {
        &self.exchange_key
    }

    pub(crate) fn random(&self) -> &Bytes {
        &self.random
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Idempotent; returns whether this call was the one that disposed.
    pub fn dispose(&self) -> bool {
        !self.disposed.swap(true, Ordering::AcqRel)
    }
}

/// Host-level callbacks: handshake intake, connectionless traffic and
/// failures that are not attributable to one peer.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HostListener: Send + Sync + 'static {
    /// An inbound connection request, together with the application payload
    /// attached to it. Call [`crate::host::Host::accept`] or
    /// [`crate::host::Host::reject`] with it - the host itself takes no
    /// default action.
    async fn on_receive_request(&self, request: ConnectionRequest, payload: Bytes);

    async fn on_receive_unconnected(&self, remote: SocketAddr, payload: Bytes) {
        let _ = (remote, payload);
    }

    async fn on_receive_broadcast(&self, remote: SocketAddr, payload: Bytes) {
        let _ = (remote, payload);
    }

    /// Raw bytes from a remote that neither parse as connectionless traffic
    /// nor belong to a registered peer.
    async fn on_receive_socket(&self, remote: SocketAddr, datagram: Bytes) {
        let _ = (remote, datagram);
    }

    /// A per-datagram or socket-level failure. The host keeps running.
    async fn on_exception(&self, remote: Option<SocketAddr>, error: TransportError) {
        let _ = (remote, error);
    }

    async fn on_shutdown(&self) {}
}

/// Per-connection callbacks.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PeerListener: Send + Sync + 'static {
    /// Fires at most once per peer lifetime, when the handshake completes.
    async fn on_connect(&self, peer: Arc<Peer>);

    /// Fires exactly once per peer lifetime. `payload` carries the remote's
    /// opaque REJECT payload when `reason` is
    /// [`DisconnectReason::Rejected`].
    async fn on_disconnect(
        &self,
        peer: Arc<Peer>,
        payload: Option<Bytes>,
        reason: DisconnectReason,
        error: Option<TransportError>,
    );

    async fn on_receive(&self, peer: Arc<Peer>, payload: Bytes, info: MessageInfo);

    async fn on_update_rtt(&self, peer: Arc<Peer>, rtt_ms: u16) {
        let _ = (peer, rtt_ms);
    }

    /// A per-message failure on this connection. The peer keeps running.
    async fn on_exception(&self, peer: Arc<Peer>, error: TransportError) {
        let _ = (peer, error);
    }
}
