//! Transfer counters, kept per host and per peer.
//!
//! All counters are updated with relaxed atomics; readers accept transient
//! inconsistency between related counters. Everything is monotonically
//! increasing except `message_receive_lost`, which is an estimator: a
//! presumed-lost message that arrives late takes its loss back.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct Statistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    messages_resent: AtomicU64,
    message_receive_duplicated: AtomicU64,
    message_receive_lost: AtomicU64,
    fragments_sent: AtomicU64,
    fragments_received: AtomicU64,
}

macro_rules! counter {
    ($add:ident, $get:ident, $field:ident) => {
        pub fn $add(&self, n: u64) {
            self.$field.fetch_add(n, Ordering::Relaxed);
        }

        pub fn $get(&self) -> u64 {
            self.$field.load(Ordering::Relaxed)
        }
    };
}

impl Statistics {
    counter!(add_bytes_sent, bytes_sent, bytes_sent);
    counter!(add_bytes_received, bytes_received, bytes_received);
    counter!(add_packets_sent, packets_sent, packets_sent);
    counter!(add_packets_received, packets_received, packets_received);
    counter!(add_messages_sent, messages_sent, messages_sent);
    counter!(add_messages_received, messages_received, messages_received);
    counter!(add_messages_resent, messages_resent, messages_resent);
    counter!(add_message_receive_duplicated, message_receive_duplicated, message_receive_duplicated);
    counter!(add_message_receive_lost, message_receive_lost, message_receive_lost);
    counter!(add_fragments_sent, fragments_sent, fragments_sent);
    counter!(add_fragments_received, fragments_received, fragments_received);

    /// Take one loss back after a presumed-lost message arrived late.
    /// Saturates at zero.
    pub fn retract_message_receive_lost(&self) {
        let _ = self.message_receive_lost.fetch_update(
            Ordering::Relaxed,
            Ordering::Relaxed,
            |lost| Some(lost.saturating_sub(1)),
        );
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            packets_sent: self.packets_sent(),
            packets_received: self.packets_received(),
            messages_sent: self.messages_sent(),
            messages_received: self.messages_received(),
            messages_resent: self.messages_resent(),
            message_receive_duplicated: self.message_receive_duplicated(),
            message_receive_lost: self.message_receive_lost(),
            fragments_sent: self.fragments_sent(),
            fragments_received: self.fragments_received(),
        }
    }
}

/// A point-in-time copy of all counters.
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct StatisticsSnapshot {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_resent: u64,
    pub message_receive_duplicated: u64,
    pub message_receive_lost: u64,
    pub fragments_sent: u64,
    pub fragments_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = Statistics::default();
        stats.add_bytes_sent(10);
        stats.add_bytes_sent(5);
        stats.add_packets_sent(1);

        assert_eq!(stats.bytes_sent(), 15);
        assert_eq!(stats.packets_sent(), 1);
        assert_eq!(stats.packets_received(), 0);
    }

    #[test]
    fn test_snapshot_copies_all_counters() {
        let stats = Statistics::default();
        stats.add_message_receive_duplicated(1);
        stats.add_fragments_received(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.message_receive_duplicated, 1);
        assert_eq!(snapshot.fragments_received, 3);
        assert_eq!(snapshot.bytes_sent, 0);
    }

    #[test]
    fn test_loss_estimator_retracts_and_saturates() {
        let stats = Statistics::default();
        stats.add_message_receive_lost(2);
        stats.retract_message_receive_lost();
        assert_eq!(stats.message_receive_lost(), 1);

        stats.retract_message_receive_lost();
        stats.retract_message_receive_lost();
        assert_eq!(stats.message_receive_lost(), 0);
        assert_eq!(stats.snapshot().message_receive_lost, 0);
    }
}
