use std::io;
use thiserror::Error;

/// Error taxonomy of the transport.
///
/// Per-datagram and per-message errors are *isolated*: the offending packet
/// is dropped, the listener's exception hook fires, and processing continues.
/// Only ack timeouts and handshake failures terminate a peer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Truncated headers, impossible lengths, unknown type tags.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A VERIFIED packet whose checksum does not match its contents.
    #[error("crc mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    CrcMismatch { expected: u32, computed: u32 },

    /// Key-exchange failure, decryption tag mismatch.
    #[error("crypto failure: {0}")]
    Crypto(String),

    /// The handshake signature did not verify against the configured key.
    #[error("handshake signature rejected")]
    BadSignature,

    /// Compressed payload that does not decompress.
    #[error("compression failure: {0}")]
    Compression(String),

    /// No acks for `resend_count` attempts, or no response to
    /// `connect_attempts` REQUESTs.
    #[error("connection timed out")]
    Timeout,

    /// A REJECT arrived during the handshake.
    #[error("connection rejected by remote")]
    Rejected,

    /// Operation on an already disposed host or peer.
    #[error("disposed")]
    Disposed,

    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    pub fn malformed(what: impl Into<String>) -> TransportError {
        TransportError::Malformed(what.into())
    }
}
