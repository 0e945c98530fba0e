//! The leading header of every datagram: a combined type/flags byte followed
//! by the optional checksum, fragmentation and timing fields.

use crate::error::TransportError;
use bitflags::bitflags;
use bytes::{Buf, BufMut};
use crc::Crc;
use num_enum::TryFromPrimitive;
use std::fmt::Debug;

const CRC32: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);

/// Low 3 bits of the packet header byte.
#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive)]
#[repr(u8)]
pub enum PacketType {
    Request = 1,
    Accept = 2,
    Reject = 3,
    Connected = 4,
    Unconnected = 5,
    Broadcast = 6,
}

bitflags! {
    /// High 5 bits of the packet header byte.
    #[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
    pub struct PacketFlags: u8 {
        /// A CRC-32 follows the header byte.
        const VERIFIED   = 0x08;
        /// A `sent_ticks` slice is present.
        const TIMED      = 0x10;
        /// This datagram is one part of a larger packet.
        const FRAGMENTED = 0x20;
        /// The payload was block-compressed before (optional) encryption.
        const COMPRESSED = 0x40;
        /// The payload is a sequence of length-prefixed message records.
        const COMBINED   = 0x80;
    }
}

const TYPE_MASK: u8 = 0b0000_0111;

/// Position of one part within a fragmented packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct FragmentInfo {
    pub fragment_id: u16,
    pub part: u16,
    pub last_part: u16,
}

/// Parsed form of everything preceding a datagram's payload.
#[derive(Clone, Eq, PartialEq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    pub flags: PacketFlags,
    pub fragment: Option<FragmentInfo>,
    pub sent_ticks: Option<u16>,
}

impl Debug for PacketHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let frag = match &self.fragment {
            Some(fr) => format!("#{}:{}/{}", fr.fragment_id, fr.part, fr.last_part),
            None => String::new(),
        };
        write!(f, "PKT{{{:?}{}{}}}", self.packet_type, frag,
            self.sent_ticks.map(|t| format!("@{t}")).unwrap_or_default())
    }
}

impl PacketHeader {
    /// Worst-case header length: type/flags byte, CRC, fragment triple and
    /// tick slice. The outgoing aggregation buffer reserves exactly this much
    /// in front of the first message so a single-message packet can be
    /// emitted without copying.
    pub const MAX_SERIALIZED_LEN: usize = 1 + 4 + 6 + 2;

    pub fn new(packet_type: PacketType, flags: PacketFlags) -> PacketHeader {
        PacketHeader { packet_type, flags, fragment: None, sent_ticks: None }
    }

    pub fn with_fragment(mut self, fragment: FragmentInfo) -> PacketHeader {
        self.flags |= PacketFlags::FRAGMENTED;
        self.fragment = Some(fragment);
        self
    }

    pub fn with_sent_ticks(mut self, ticks: u16) -> PacketHeader {
        self.flags |= PacketFlags::TIMED;
        self.sent_ticks = Some(ticks);
        self
    }

    pub fn serialized_len(&self) -> usize {
        1 + if self.flags.contains(PacketFlags::VERIFIED) { 4 } else { 0 }
            + if self.flags.contains(PacketFlags::FRAGMENTED) { 6 } else { 0 }
            + if self.flags.contains(PacketFlags::TIMED) { 2 } else { 0 }
    }

    /// Write the header. The CRC field, when present, is written as zero and
    /// patched by [`PacketHeader::patch_crc`] once the packet is complete.
    pub fn ser(&self, buf: &mut impl BufMut) {
        debug_assert_eq!(self.flags.contains(PacketFlags::FRAGMENTED), self.fragment.is_some());
        debug_assert_eq!(self.flags.contains(PacketFlags::TIMED), self.sent_ticks.is_some());

        buf.put_u8(self.packet_type as u8 | self.flags.bits());
        if self.flags.contains(PacketFlags::VERIFIED) {
            buf.put_u32_le(0);
        }
        if let Some(fragment) = &self.fragment {
            buf.put_u16_le(fragment.fragment_id);
            buf.put_u16_le(fragment.part);
            buf.put_u16_le(fragment.last_part);
        }
        if let Some(ticks) = self.sent_ticks {
            buf.put_u16_le(ticks);
        }
    }

    /// Compute the checksum over everything after the CRC field and patch it
    /// into a finished packet. No-op for packets without VERIFIED.
    pub fn patch_crc(packet: &mut [u8]) {
        if !PacketFlags::from_bits_truncate(packet[0]).contains(PacketFlags::VERIFIED) {
            return;
        }
        let crc = CRC32.checksum(&packet[5..]);
        packet[1..5].copy_from_slice(&crc.to_le_bytes());
    }

    /// Parse a header from the start of a datagram, verifying the checksum
    /// of VERIFIED packets when `verify_crc` is set. On success the buffer
    /// is left at the first payload byte.
    pub fn deser(buf: &mut &[u8], verify_crc: bool) -> Result<PacketHeader, TransportError> {
        if buf.is_empty() {
            return Err(TransportError::malformed("empty datagram"));
        }
        let lead = buf.get_u8();
        let packet_type = PacketType::try_from(lead & TYPE_MASK)
            .map_err(|_| TransportError::Malformed(format!("unknown packet type {}", lead & TYPE_MASK)))?;
        let flags = PacketFlags::from_bits_truncate(lead);

        if flags.contains(PacketFlags::VERIFIED) {
            let expected = buf.try_get_u32_le()
                .map_err(|_| TransportError::malformed("truncated crc field"))?;
            if verify_crc {
                let computed = CRC32.checksum(*buf);
                if computed != expected {
                    return Err(TransportError::CrcMismatch { expected, computed });
                }
            }
        }

        let fragment = if flags.contains(PacketFlags::FRAGMENTED) {
            let fragment_id = buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated fragment header"))?;
            let part = buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated fragment header"))?;
            let last_part = buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated fragment header"))?;
            if part > last_part {
                return Err(TransportError::Malformed(
                    format!("fragment part {part} beyond last part {last_part}")));
            }
            Some(FragmentInfo { fragment_id, part, last_part })
        } else {
            None
        };

        let sent_ticks = if flags.contains(PacketFlags::TIMED) {
            Some(buf.try_get_u16_le()
                .map_err(|_| TransportError::malformed("truncated tick slice"))?)
        } else {
            None
        };

        Ok(PacketHeader { packet_type, flags, fragment, sent_ticks })
    }
}
