//! Host- and peer-level configuration.

use crate::compress::{Compressor, Lz4Compressor};
use crate::crypto::{CryptoProvider, DefaultCrypto};
use anyhow::bail;
use std::sync::Arc;
use std::time::Duration;

/// Configuration of a [`crate::host::Host`]: the socket, the shared
/// capability factories and the buffer pool.
#[derive(Clone)]
pub struct HostConfig {
    /// UDP port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Bind a dual-stack `[::]` socket instead of an IPv4-only one. Remote
    /// v4-mapped addresses are canonicalized when keying peers.
    pub dual_mode: bool,
    /// Enable sending to the broadcast address.
    pub broadcast: bool,
    /// Offer an exchange key in outgoing handshakes and derive a packet
    /// cipher for every connection.
    pub encryption: bool,
    /// Compress packet payloads when it shrinks them.
    pub compression: bool,
    /// Append/verify a CRC-32 on every packet.
    pub crc32: bool,
    /// Number of concurrent receive tasks draining the socket.
    pub receive_count: usize,
    /// Size of the buffer each receive task reads datagrams into; inbound
    /// datagrams beyond this length are truncated by the OS and will fail
    /// parsing.
    pub receive_mtu: usize,
    /// Requested socket send buffer size. Applied only where the platform
    /// socket API exposes it; retained in the config so deployments can
    /// record their tuning either way.
    pub send_buffer_size: usize,
    /// Requested socket receive buffer size. Same caveat as
    /// [`HostConfig::send_buffer_size`].
    pub receive_buffer_size: usize,
    /// Number of buffers the allocator retains.
    pub allocator_count: usize,
    /// Capacity of pooled buffers.
    pub allocator_pooled_length: usize,
    /// Minimum capacity of freshly created pooled buffers.
    pub allocator_pooled_expand_length: usize,
    /// Granularity for allocations beyond the pooled length.
    pub allocator_expand_length: usize,
    /// Hard cap on any single allocation (bounds reassembled packets).
    pub allocator_max_length: usize,
    /// Seed of the host's long-term signing key. A fresh key is generated
    /// when absent.
    pub private_key: Option<[u8; 32]>,
    /// Factory for key exchange, packet cipher, signatures and randomness.
    pub crypto: Arc<dyn CryptoProvider>,
    /// Block compressor used when [`HostConfig::compression`] is set.
    pub compressor: Arc<dyn Compressor>,
}

impl Default for HostConfig {
    fn default() -> HostConfig {
        HostConfig {
            port: 0,
            dual_mode: false,
            broadcast: false,
            encryption: true,
            compression: false,
            crc32: true,
            receive_count: 1,
            receive_mtu: 2048,
            send_buffer_size: 1 << 18,
            receive_buffer_size: 1 << 18,
            allocator_count: 1024,
            allocator_pooled_length: 2048,
            allocator_pooled_expand_length: 2048,
            allocator_expand_length: 8192,
            allocator_max_length: 16 << 20,
            private_key: None,
            crypto: Arc::new(DefaultCrypto),
            compressor: Arc::new(Lz4Compressor),
        }
    }
}

impl HostConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.receive_mtu < 128 {
            bail!("receive MTU of {} is too small for packet headers", self.receive_mtu);
        }
        if self.receive_count == 0 {
            bail!("at least one receive task is required");
        }
        if self.allocator_pooled_length < self.receive_mtu {
            bail!("pooled buffers of {} bytes cannot hold a {} byte datagram",
                self.allocator_pooled_length, self.receive_mtu);
        }
        if self.allocator_expand_length == 0 {
            bail!("allocator expand length must be non-zero");
        }
        Ok(())
    }
}

/// Configuration of one connection. Immutable for the peer's lifetime.
#[derive(Clone)]
pub struct PeerConfig {
    /// Upper bound for produced datagrams; packets beyond it are fragmented.
    pub mtu: usize,
    /// Interval of the keep-alive pinger.
    pub ping_delay: Duration,
    /// How long small messages linger in the aggregation buffer before the
    /// coalesced packet is flushed.
    pub send_delay: Duration,
    /// How many REQUEST packets to send before giving up on a connect.
    pub connect_attempts: u32,
    /// Pause between REQUEST attempts.
    pub connect_delay: Duration,
    /// How many emissions a reliable message gets before the peer is
    /// declared dead.
    pub resend_count: u32,
    /// Lower clamp of the RTT-derived resend delay.
    pub resend_delay_min: Duration,
    /// Upper clamp of the RTT-derived resend delay.
    pub resend_delay_max: Duration,
    /// Random extra resend delay, de-synchronizing resend bursts.
    pub resend_delay_jitter: Duration,
    /// How long an incomplete fragment assembly is retained.
    pub fragment_timeout: Duration,
    /// How long a received `(channel, sequence)` pair suppresses duplicates.
    pub duplicate_timeout: Duration,
    /// How many stall iterations an ordered message waits for its gap to
    /// fill before it is delivered regardless. 0 disables delaying.
    pub ordered_delay_max: u32,
    /// Length of one ordering stall iteration. Zero disables delaying.
    pub ordered_delay_timeout: Duration,
    /// After this many consecutive unsequenced messages on a channel, a
    /// sequence number is injected anyway so the receiver's loss estimator
    /// keeps a reference point.
    pub unsequenced_max: u16,
    /// Grace period between a DISCONNECT notice and tearing the state down.
    pub disconnect_delay: Duration,
    /// Expected identity key of the remote; when set, the remote's ACCEPT
    /// must carry a valid signature of our challenge under this key.
    pub remote_public_key: Option<[u8; 32]>,
}

impl Default for PeerConfig {
    fn default() -> PeerConfig {
        PeerConfig {
            mtu: 1200,
            ping_delay: Duration::from_millis(1000),
            send_delay: Duration::from_millis(15),
            connect_attempts: 10,
            connect_delay: Duration::from_millis(300),
            resend_count: 12,
            resend_delay_min: Duration::from_millis(100),
            resend_delay_max: Duration::from_millis(600),
            resend_delay_jitter: Duration::from_millis(40),
            fragment_timeout: Duration::from_secs(16),
            duplicate_timeout: Duration::from_secs(8),
            ordered_delay_max: 8,
            ordered_delay_timeout: Duration::from_millis(200),
            unsequenced_max: 64,
            disconnect_delay: Duration::from_millis(500),
            remote_public_key: None,
        }
    }
}

impl PeerConfig {
    /// Delaying of out-of-order reliable messages is on only when both knobs
    /// are non-zero.
    pub fn ordered_delay_enabled(&self) -> bool {
        self.ordered_delay_max > 0 && !self.ordered_delay_timeout.is_zero()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 64 {
            bail!("MTU of {} cannot fit packet headers and a message", self.mtu);
        }
        if self.connect_attempts == 0 {
            bail!("at least one connect attempt is required");
        }
        if self.resend_count == 0 {
            bail!("at least one send attempt is required");
        }
        if self.resend_delay_min > self.resend_delay_max {
            bail!("resend delay range is inverted: {:?} > {:?}",
                self.resend_delay_min, self.resend_delay_max);
        }
        Ok(())
    }
}
