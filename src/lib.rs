//! A peer-to-peer reliable-messaging transport on top of UDP.
//!
//! The transport turns an unreliable, unordered, size-limited datagram channel
//! into a set of independent bidirectional connections ("peers") over which
//! applications exchange messages with *per-message* selections of
//! reliability, ordering, uniqueness and timing. Each peer negotiates
//! encryption and authentication at handshake time, fragments and reassembles
//! oversized packets, acknowledges reliable messages, resends on loss,
//! suppresses duplicates, delivers ordered streams in order, and measures
//! round-trip time continuously.
//!
//! ## Design goals
//!
//! * Peer-to-peer without a dedicated server role: every [`host::Host`] owns
//!   one listening UDP socket that multiplexes all of its connections, and
//!   either side may initiate.
//! * The abstraction is sending / receiving *messages* (defined-length chunks
//!   of data), not byte streams.
//! * Reliability is opt-in per message: an unreliable message costs one
//!   datagram and no bookkeeping, a reliable one is resent until acknowledged
//!   or until the peer is declared dead.
//! * Ordering and duplicate suppression are per-channel (256 channels per
//!   peer), so a gap on one channel never delays another.
//! * Small messages produced close together are coalesced into a single
//!   datagram to amortize header, checksum and cipher overhead.
//! * Big messages are split below the configured MTU and reassembled on the
//!   far side - the transport never relies on IP-level fragmentation.
//! * Encryption (X25519 key agreement + AES-256-GCM) and handshake
//!   authentication (Ed25519 signature over a random challenge) are optional
//!   and negotiated per connection; the capabilities are pluggable traits.
//!
//! ## Wire format
//!
//! Every datagram starts with one header byte:
//!
//! ```ascii
//! bit 0..2 : packet type - 1 REQUEST, 2 ACCEPT, 3 REJECT, 4 CONNECTED,
//!                          5 UNCONNECTED, 6 BROADCAST
//! bit 3..7 : packet flags - VERIFIED, TIMED, FRAGMENTED, COMPRESSED, COMBINED
//! ```
//!
//! followed, in this order and only when the corresponding flag is set, by
//!
//! ```ascii
//! crc          (u32 LE) - CRC-32 (IEEE) over every byte after this field
//! fragment_id  (u16 LE)
//! part         (u16 LE)
//! last_part    (u16 LE)
//! sent_ticks   (u16 LE) - low 16 bits of the sender's millisecond clock
//! ```
//!
//! and then the payload. On CONNECTED packets the payload is one message, or,
//! if COMBINED is set, a sequence of `(u32 LE length, message)` records. A
//! message starts with its own header byte (2 type bits: CUSTOM, ACKNOWLEDGE,
//! DISCONNECT, PING; 6 flag bits: TIMED, RELIABLE, ORDERED, UNIQUE, CHANNELED,
//! SEQUENCED) followed by `created_ticks: u16` (TIMED), `sequence: u16`
//! (SEQUENCED), `attempt: u8` (RELIABLE) and `channel: u8` (CHANNELED;
//! channel 0 omits the byte). All integers are little-endian.
//!
//! The handshake REQUEST payload is `key_len: u16, random_len: u16,
//! key: [u8; key_len], random: [u8; random_len]` followed by an optional
//! application payload; ACCEPT has the same shape but `random` is the
//! accepting side's signature over the REQUEST's random bytes. When a peer
//! has negotiated a cipher, the payload of CONNECTED packets (after the
//! headers above) is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.
//!
//! ## Getting started
//!
//! Open a [`host::Host`] bound to a UDP port, then either call
//! [`host::Host::connect`] or accept inbound requests delivered to your
//! [`events::HostListener`]. Once connected, enqueue [`message::OutgoingMessage`]s
//! on the [`peer::Peer`]; inbound traffic arrives through the
//! [`events::PeerListener`] callbacks.

pub mod buffers;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod error;
pub mod events;
pub mod host;
pub mod message;
pub mod message_header;
pub mod packet_header;
pub mod peer;
pub mod statistics;
pub mod ticks;

pub use config::{HostConfig, PeerConfig};
pub use error::TransportError;
pub use events::{ConnectionRequest, DisconnectReason, HostListener, PeerListener};
pub use host::Host;
pub use message::{MessageInfo, OutgoingMessage};
pub use peer::{Peer, SentMessage};
