//! The per-message header inside CONNECTED packets.

use crate::error::TransportError;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use num_enum::TryFromPrimitive;
use std::fmt::Debug;

/// Low 2 bits of the message header byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum MessageType {
    /// Application payload.
    Custom = 0,
    /// Receipt for a reliable message, echoing its channel, sequence and
    /// attempt.
    Acknowledge = 1,
    /// Orderly termination announcement.
    Disconnect = 2,
    /// Keep-alive; exists only to trigger acknowledgements and RTT samples.
    Ping = 3,
}

bitflags! {
    /// High 6 bits of the message header byte.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
    pub struct MessageFlags: u8 {
        /// A `created_ticks` slice is present.
        const TIMED     = 0x04;
        /// Resent until acknowledged; an attempt counter is present.
        const RELIABLE  = 0x08;
        /// Delivered in ascending per-channel sequence order.
        const ORDERED   = 0x10;
        /// Delivered at most once per `(channel, sequence)`.
        const UNIQUE    = 0x20;
        /// A channel byte is present (channel 0 omits it).
        const CHANNELED = 0x40;
        /// A sequence number is present.
        const SEQUENCED = 0x80;
    }
}

const TYPE_MASK: u8 = 0b0000_0011;

/// Parsed form of a message header inside a CONNECTED packet.
#[derive(Clone, Eq, PartialEq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub flags: MessageFlags,
    pub created_ticks: Option<u16>,
    pub sequence: Option<u16>,
    pub attempt: u8,
    pub channel: u8,
}

impl Debug for MessageHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MSG{{{:?} ch{} {} a{}}}", self.message_type, self.channel,
            self.sequence.map(|s| format!("seq{s}")).unwrap_or_else(|| "-".to_string()),
            self.attempt)
    }
}

impl MessageHeader {
    /// Longest possible encoding: header byte, ticks, sequence, attempt and
    /// channel.
    pub const MAX_SERIALIZED_LEN: usize = 1 + 2 + 2 + 1 + 1;

    pub fn new(message_type: MessageType, flags: MessageFlags, channel: u8) -> MessageHeader {
        let mut flags = flags;
        if channel != 0 {
            flags |= MessageFlags::CHANNELED;
        } else {
            flags -= MessageFlags::CHANNELED;
        }
        MessageHeader {
            message_type,
            flags,
            created_ticks: None,
            sequence: None,
            attempt: 0,
            channel,
        }
    }

    pub fn with_created_ticks(mut self, ticks: u16) -> MessageHeader {
        self.flags |= MessageFlags::TIMED;
        self.created_ticks = Some(ticks);
        self
    }

    pub fn with_sequence(mut self, sequence: u16) -> MessageHeader {
        self.flags |= MessageFlags::SEQUENCED;
        self.sequence = Some(sequence);
        self
    }

    pub fn with_attempt(mut self, attempt: u8) -> MessageHeader {
        self.attempt = attempt;
        self
    }

    pub fn serialized_len(&self) -> usize {
        1 + if self.flags.contains(MessageFlags::TIMED) { 2 } else { 0 }
            + if self.flags.contains(MessageFlags::SEQUENCED) { 2 } else { 0 }
            + if self.flags.contains(MessageFlags::RELIABLE) { 1 } else { 0 }
            + if self.flags.contains(MessageFlags::CHANNELED) { 1 } else { 0 }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert_eq!(self.flags.contains(MessageFlags::TIMED), self.created_ticks.is_some());
        debug_assert_eq!(self.flags.contains(MessageFlags::SEQUENCED), self.sequence.is_some());
        debug_assert_eq!(self.flags.contains(MessageFlags::CHANNELED), self.channel != 0);

        buf.put_u8(self.message_type as u8 | self.flags.bits());
        if let Some(ticks) = self.created_ticks {
            buf.put_u16_le(ticks);
        }
        if let Some(sequence) = self.sequence {
            buf.put_u16_le(sequence);
        }
        if self.flags.contains(MessageFlags::RELIABLE) {
            buf.put_u8(self.attempt);
        }
        if self.flags.contains(MessageFlags::CHANNELED) {
            buf.put_u8(self.channel);
        }
    }

    pub fn deser(buf: &mut &[u8]) -> Result<MessageHeader, TransportError> {
        if buf.is_empty() {
            return Err(TransportError::malformed("empty message"));
        }
        let lead = buf.get_u8();
        let message_type = MessageType::try_from(lead & TYPE_MASK)
            .expect("2-bit tag always maps to a message type");
        let flags = MessageFlags::from_bits_truncate(lead);

        let created_ticks = if flags.contains(MessageFlags::TIMED) {
            Some(buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated created ticks"))?)
        } else {
            None
        };
        let sequence = if flags.contains(MessageFlags::SEQUENCED) {
            Some(buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated sequence"))?)
        } else {
            None
        };
        let attempt = if flags.contains(MessageFlags::RELIABLE) {
            buf.try_get_u8()
                .map_err(|_| TransportError::malformed("truncated attempt counter"))?
        } else {
            0
        };
        let channel = if flags.contains(MessageFlags::CHANNELED) {
            buf.try_get_u8()
                .map_err(|_| TransportError::malformed("truncated channel"))?
        } else {
            0
        };

        Ok(MessageHeader { message_type, flags, created_ticks, sequence, attempt, channel })
    }
}
