//! Per-channel ordered delivery.
//!
//! Each channel tracks the last in-order delivered sequence. A message that
//! leads the expected sequence (a reorder gap) is either delivered anyway
//! (unreliable, or delaying disabled) or parked until the channel's stall
//! signal fires or the delay budget runs out. The stall signal is a one-shot
//! notifier replaced on every notification; a waiter that grabbed a stale
//! notifier simply re-reads the channel state on its next timeout tick, so a
//! missed wakeup costs at most one `ordered_delay_timeout`.

use crate::message::MessageInfo;
use crate::message_header::MessageFlags;
use crate::peer::Peer;
use crate::ticks::slice_delta;
use bytes::Bytes;
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, trace};

pub(crate) struct OrderingEngine {
    channels: Box<[Mutex<ChannelOrdering>]>,
}

struct ChannelOrdering {
    last_delivered: u16,
    stall: Arc<Notify>,
}

/// Outcome of one attempt to pass a message through a channel's order gate.
#[derive(Debug)]
pub(crate) enum Step {
    /// In order (or an accepted jump): deliver and advance the channel.
    Deliver,
    /// Lags the channel but is reliable - it was already counted lost, so it
    /// is delivered without advancing the channel.
    DeliverLate,
    /// Lags the channel and is unreliable: dropped.
    Drop,
    /// Leads the channel; wait for the gap to fill.
    Wait(Arc<Notify>),
}

impl OrderingEngine {
    pub(crate) fn new() -> OrderingEngine {
        OrderingEngine {
            channels: (0..256)
                .map(|_| {
                    Mutex::new(ChannelOrdering {
                        last_delivered: 0,
                        stall: Arc::new(Notify::new()),
                    })
                })
                .collect(),
        }
    }

    /// One pass through the gate. `may_wait` is false for unreliable
    /// messages, when delaying is disabled, and when the caller's delay
    /// budget is spent - in those cases a leading message is delivered as a
    /// jump.
    pub(crate) fn step(&self, channel: u8, sequence: u16, may_wait: bool) -> Step {
        let mut state = self.channels[channel as usize].lock().unwrap();
        let expected = state.last_delivered.wrapping_add(1);

        if sequence == expected {
            state.advance(sequence);
            return Step::Deliver;
        }

        if slice_delta(sequence, state.last_delivered) > 0 {
            if may_wait {
                return Step::Wait(state.stall.clone());
            }
            state.advance(sequence);
            return Step::Deliver;
        }

        if may_wait {
            // reliable late arrival
            Step::DeliverLate
        } else {
            Step::Drop
        }
    }

    /// Late arrivals of *reliable* messages are delivered even though the
    /// channel has moved past them.
    pub(crate) fn step_for(&self, channel: u8, sequence: u16, reliable: bool, may_wait: bool) -> Step {
        match self.step(channel, sequence, may_wait && reliable) {
            Step::Drop if reliable => Step::DeliverLate,
            Step::DeliverLate if !reliable => Step::Drop,
            step => step,
        }
    }

    #[cfg(test)]
    fn last_delivered(&self, channel: u8) -> u16 {
        self.channels[channel as usize].lock().unwrap().last_delivered
    }
}

impl ChannelOrdering {
    /// Move the channel forward and wake everything parked behind the old
    /// position. The notifier is replaced so future waiters register on a
    /// fresh one.
    fn advance(&mut self, sequence: u16) {
        self.last_delivered = sequence;
        let stall = std::mem::replace(&mut self.stall, Arc::new(Notify::new()));
        stall.notify_waiters();
    }
}

impl Peer {
    /// Run one UNIQUE + ORDERED message through the ordering engine,
    /// delivering inline when possible and parking a waiter task for
    /// reorder gaps.
    pub(crate) async fn deliver_ordered(
        self: &Arc<Self>,
        sequence: u16,
        payload: Bytes,
        info: MessageInfo,
    ) {
        let reliable = info.flags.contains(MessageFlags::RELIABLE);
        let delay_enabled = self.config.ordered_delay_enabled();

        match self.ordering.step_for(info.channel, sequence, reliable, delay_enabled) {
            Step::Deliver | Step::DeliverLate => {
                self.listener.on_receive(self.clone(), payload, info).await;
            }
            Step::Drop => {
                trace!("dropping late unreliable message seq {} on channel {}", sequence, info.channel);
            }
            Step::Wait(notify) => {
                // park outside the receive path so other channels and
                // packets keep flowing
                let peer = self.clone();
                tokio::spawn(async move {
                    peer.wait_and_deliver(notify, sequence, payload, info).await;
                });
            }
        }
    }

    async fn wait_and_deliver(
        self: &Arc<Self>,
        first_stall: Arc<Notify>,
        sequence: u16,
        payload: Bytes,
        info: MessageInfo,
    ) {
        let mut stall = first_stall;
        let mut iterations = 0u32;

        loop {
            tokio::select! {
                _ = self.dispose_token.cancelled() => return,
                _ = stall.notified() => {}
                _ = tokio::time::sleep(self.config.ordered_delay_timeout) => {
                    iterations += 1;
                }
            }

            let may_wait = iterations < self.config.ordered_delay_max;
            match self.ordering.step_for(info.channel, sequence, true, may_wait) {
                Step::Deliver | Step::DeliverLate => {
                    if iterations >= self.config.ordered_delay_max {
                        debug!(
                            "delivering seq {} on channel {} after exhausted delay budget",
                            sequence, info.channel
                        );
                    }
                    self.listener.on_receive(self.clone(), payload, info).await;
                    return;
                }
                Step::Drop => return,
                Step::Wait(next) => stall = next,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_in_order_advances() {
        let engine = OrderingEngine::new();
        assert!(matches!(engine.step(0, 1, true), Step::Deliver));
        assert!(matches!(engine.step(0, 2, true), Step::Deliver));
        assert_eq!(engine.last_delivered(0), 2);
    }

    #[test]
    fn test_gap_waits_then_drains() {
        let engine = OrderingEngine::new();
        assert!(matches!(engine.step(0, 2, true), Step::Wait(_)));
        assert!(matches!(engine.step(0, 1, true), Step::Deliver));
        // the gap is closed now
        assert!(matches!(engine.step(0, 2, true), Step::Deliver));
    }

    #[test]
    fn test_gap_without_wait_budget_jumps() {
        let engine = OrderingEngine::new();
        assert!(matches!(engine.step(0, 5, false), Step::Deliver));
        assert_eq!(engine.last_delivered(0), 5);
    }

    #[rstest]
    #[case::reliable(true)]
    #[case::unreliable(false)]
    fn test_late_arrivals(#[case] reliable: bool) {
        let engine = OrderingEngine::new();
        assert!(matches!(engine.step(0, 4, false), Step::Deliver));

        match engine.step_for(0, 2, reliable, true) {
            Step::DeliverLate => assert!(reliable),
            Step::Drop => assert!(!reliable),
            other => panic!("unexpected step {other:?}"),
        }
        // late delivery must not move the channel backwards
        assert_eq!(engine.last_delivered(0), 4);
    }

    #[test]
    fn test_channels_are_independent() {
        let engine = OrderingEngine::new();
        assert!(matches!(engine.step(7, 2, true), Step::Wait(_)));
        assert!(matches!(engine.step(8, 1, true), Step::Deliver));
    }

    #[test]
    fn test_sequence_wraps_around() {
        let engine = OrderingEngine::new();
        engine.channels[0].lock().unwrap().last_delivered = u16::MAX;
        assert!(matches!(engine.step(0, 0, true), Step::Deliver));
        assert!(matches!(engine.step(0, 1, true), Step::Deliver));
    }

    #[tokio::test]
    async fn test_advance_wakes_waiters() {
        let engine = OrderingEngine::new();
        let notify = match engine.step(0, 3, true) {
            Step::Wait(notify) => notify,
            other => panic!("unexpected step {other:?}"),
        };

        let waiter = tokio::spawn(async move { notify.notified().await });
        tokio::task::yield_now().await;

        assert!(matches!(engine.step(0, 1, true), Step::Deliver));
        waiter.await.unwrap();
    }
}
