//! Application-facing message types.

use crate::message_header::{MessageFlags, MessageType};
use bytes::Bytes;

/// What an application hands to [`crate::peer::Peer::send`]: a payload plus
/// the per-message delivery selections.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub payload: Bytes,
    pub channel: u8,
    /// Ship the creation time so the receiver can reconstruct it.
    pub timed: bool,
    /// Resend until acknowledged.
    pub reliable: bool,
    /// Deliver in ascending per-channel sequence order.
    pub ordered: bool,
    /// Deliver at most once.
    pub unique: bool,
}

impl OutgoingMessage {
    /// An unreliable, unordered message on channel 0.
    pub fn new(payload: impl Into<Bytes>) -> OutgoingMessage {
        OutgoingMessage {
            payload: payload.into(),
            channel: 0,
            timed: false,
            reliable: false,
            ordered: false,
            unique: false,
        }
    }

    /// The usual "TCP-like" selection: reliable, ordered and duplicate-free.
    pub fn reliable_ordered(channel: u8, payload: impl Into<Bytes>) -> OutgoingMessage {
        OutgoingMessage {
            payload: payload.into(),
            channel,
            timed: false,
            reliable: true,
            ordered: true,
            unique: true,
        }
    }

    pub fn on_channel(mut self, channel: u8) -> OutgoingMessage {
        self.channel = channel;
        self
    }

    pub fn timed(mut self) -> OutgoingMessage {
        self.timed = true;
        self
    }

    pub fn reliable(mut self) -> OutgoingMessage {
        self.reliable = true;
        self
    }

    pub fn ordered(mut self) -> OutgoingMessage {
        self.ordered = true;
        self
    }

    pub fn unique(mut self) -> OutgoingMessage {
        self.unique = true;
        self
    }

    pub(crate) fn base_flags(&self) -> MessageFlags {
        let mut flags = MessageFlags::empty();
        if self.timed {
            flags |= MessageFlags::TIMED;
        }
        if self.reliable {
            flags |= MessageFlags::RELIABLE;
        }
        if self.ordered {
            flags |= MessageFlags::ORDERED;
        }
        if self.unique {
            flags |= MessageFlags::UNIQUE;
        }
        flags
    }
}

/// Metadata delivered to [`crate::events::PeerListener::on_receive`] next to
/// the payload.
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub channel: u8,
    /// Retry counter of the received emission; 0 for the first send.
    pub attempt: u8,
    pub sequence: Option<u16>,
    /// Low 16 bits of the remote's clock when the message was created.
    pub remote_created_ticks: Option<u16>,
    /// Low 16 bits of the remote's clock when the packet was sent.
    pub remote_sent_ticks: Option<u16>,
    /// The creation time lifted onto this host's millisecond clock, when the
    /// message was TIMED and the clock skew is known.
    pub local_created_ms: Option<u64>,
}
