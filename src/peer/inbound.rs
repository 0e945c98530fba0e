//! The incoming pipeline: verify, reassemble, decrypt, decompress,
//! demultiplex.
//!
//! Every error in here is isolated to the offending datagram or message:
//! report through the exception hook, drop, continue.

use crate::error::TransportError;
use crate::events::DisconnectReason;
use crate::message::MessageInfo;
use crate::message_header::{MessageFlags, MessageHeader, MessageType};
use crate::packet_header::{PacketFlags, PacketHeader, PacketType};
use crate::peer::Peer;
use crate::ticks::slice_delta;
use bytes::{Buf, Bytes};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, trace};

impl Peer {
    /// Entry point for every datagram the host attributes to this peer.
    pub(crate) async fn on_receive(self: &Arc<Self>, datagram: &[u8]) {
        self.statistics.add_packets_received(1);
        self.statistics.add_bytes_received(datagram.len() as u64);

        let mut buf = datagram;
        let header = match PacketHeader::deser(&mut buf, self.ctx.crc32) {
            Ok(header) => header,
            Err(e) => {
                self.report_exception(e).await;
                return;
            }
        };
        trace!("received {:?} from {:?}", header, self.remote_endpoint());

        match header.packet_type {
            PacketType::Request => self.handle_duplicate_request().await,
            PacketType::Accept => self.handle_accept(buf).await,
            PacketType::Reject => self.handle_reject(buf).await,
            PacketType::Connected => {
                if let Err(e) = self.handle_connected(&header, buf).await {
                    self.report_exception(e).await;
                }
            }
            PacketType::Unconnected | PacketType::Broadcast => {
                // connectionless traffic is dispatched by the host, never here
                self.report_exception(TransportError::malformed(
                    "connectionless packet routed to a peer",
                ))
                .await;
            }
        }
    }

    async fn handle_connected(
        self: &Arc<Self>,
        header: &PacketHeader,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        let reassembled: Bytes;
        let mut region: &[u8] = payload;

        if let Some(fragment) = &header.fragment {
            match self.integrate_fragment(fragment, payload)? {
                Some(full) => {
                    reassembled = full;
                    region = &reassembled;
                }
                None => return Ok(()),
            }
        }

        let decrypted: Vec<u8>;
        if let Some(cipher) = self.cipher() {
            decrypted = cipher.decrypt(region)?;
            region = &decrypted;
        }

        let decompressed: Vec<u8>;
        if header.flags.contains(PacketFlags::COMPRESSED) {
            let compressor = self
                .ctx
                .compressor
                .as_ref()
                .ok_or_else(|| TransportError::malformed("compressed packet, compression disabled"))?;
            decompressed = compressor.decompress(region)?;
            region = &decompressed;
        }

        if header.flags.contains(PacketFlags::COMBINED) {
            let mut read = region;
            while !read.is_empty() {
                let length = read
                    .try_get_u32_le()
                    .map_err(|_| TransportError::malformed("truncated record length"))?
                    as usize;
                if length > read.len() {
                    return Err(TransportError::Malformed(format!(
                        "record of {} bytes in a packet with {} left",
                        length,
                        read.len()
                    )));
                }
                let (record, rest) = read.split_at(length);
                read = rest;
                self.handle_message(header, record).await;
            }
        } else {
            self.handle_message(header, region).await;
        }
        Ok(())
    }

    /// One message record: duplicate suppression, loss accounting,
    /// acknowledgement, timestamp reconstruction, then dispatch by type.
    async fn handle_message(self: &Arc<Self>, packet_header: &PacketHeader, record: &[u8]) {
        let mut buf = record;
        let header = match MessageHeader::deser(&mut buf) {
            Ok(header) => header,
            Err(e) => {
                self.report_exception(e).await;
                return;
            }
        };
        let payload = buf;

        self.statistics.add_messages_received(1);
        self.ctx.host_statistics.add_messages_received(1);

        let mut duplicate = false;
        if header.flags.contains(MessageFlags::UNIQUE) {
            if let Some(sequence) = header.sequence {
                duplicate = !self.note_unique(header.channel, sequence);
            }
        }

        if let Some(sequence) = header.sequence {
            if header.message_type != MessageType::Acknowledge && !duplicate {
                self.account_receive_sequence(header.channel, sequence);
            }
        }

        // duplicates are still acknowledged - the sender's resend loop stops
        // only once a receipt makes it back
        if header.flags.contains(MessageFlags::RELIABLE)
            && header.message_type != MessageType::Acknowledge
        {
            if let Some(sequence) = header.sequence {
                self.enqueue_ack(header.channel, sequence, header.attempt);
            } else {
                self.report_exception(TransportError::malformed(
                    "reliable message without a sequence",
                ))
                .await;
                return;
            }
        }

        if duplicate {
            trace!(
                "suppressing duplicate channel {} seq {:?}",
                header.channel, header.sequence
            );
            self.statistics.add_message_receive_duplicated(1);
            return;
        }

        let local_created_ms = header.created_ticks.and_then(|t| self.reconstruct_created(t));
        let info = MessageInfo {
            message_type: header.message_type,
            flags: header.flags,
            channel: header.channel,
            attempt: header.attempt,
            sequence: header.sequence,
            remote_created_ticks: header.created_ticks,
            remote_sent_ticks: packet_header.sent_ticks,
            local_created_ms,
        };

        match header.message_type {
            MessageType::Custom => {
                let payload = Bytes::copy_from_slice(payload);
                let ordered_unique = header
                    .flags
                    .contains(MessageFlags::UNIQUE | MessageFlags::ORDERED);
                match (ordered_unique, header.sequence) {
                    (true, Some(sequence)) => {
                        self.deliver_ordered(sequence, payload, info).await;
                    }
                    _ => {
                        self.listener.on_receive(self.clone(), payload, info).await;
                    }
                }
            }
            MessageType::Acknowledge => self.handle_ack(&header, packet_header).await,
            MessageType::Disconnect => {
                debug!("remote {:?} announced disconnect", self.remote_endpoint());
                let peer = self.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = peer.dispose_token.cancelled() => return,
                        _ = tokio::time::sleep(peer.config.disconnect_delay) => {}
                    }
                    peer.terminate(DisconnectReason::Terminated, None, None).await;
                });
            }
            MessageType::Ping => {
                // nothing beyond the statistics and the ack above
            }
        }
    }

    /// Record a unique `(channel, sequence)`; spawns the eviction task on a
    /// fresh entry. Returns false for an already-seen pair.
    fn note_unique(self: &Arc<Self>, channel: u8, sequence: u16) -> bool {
        let fresh = self.duplicates.lock().unwrap().insert((channel, sequence));
        if !fresh {
            return false;
        }

        let peer = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = peer.dispose_token.cancelled() => return,
                _ = tokio::time::sleep(peer.config.duplicate_timeout) => {}
            }
            peer.duplicates.lock().unwrap().remove(&(channel, sequence));
        });
        true
    }

    /// Per-channel loss estimator: a sequence beyond the expected one counts
    /// the gap as lost; a late arrival takes one loss back.
    fn account_receive_sequence(&self, channel: u8, sequence: u16) {
        let slot = self.receive_sequences.slot(channel);
        let mut lead = 0i16;
        let updated = slot.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |previous| {
            lead = slice_delta(sequence, previous);
            (lead > 0).then_some(sequence)
        });

        match (updated, lead) {
            (Ok(_), lead) if lead > 1 => {
                self.statistics.add_message_receive_lost(lead as u64 - 1);
                self.ctx.host_statistics.add_message_receive_lost(lead as u64 - 1);
            }
            (Err(_), _) => {
                // late arrival of a message previously counted as lost
                self.statistics.retract_message_receive_lost();
                self.ctx.host_statistics.retract_message_receive_lost();
            }
            _ => {}
        }
    }

    /// Remove the acknowledged message from the outstanding map, stop its
    /// resender, and sample RTT and clock skew from first-attempt pairs.
    async fn handle_ack(self: &Arc<Self>, header: &MessageHeader, packet_header: &PacketHeader) {
        let Some(sequence) = header.sequence else {
            self.report_exception(TransportError::malformed("ack without a sequence"))
                .await;
            return;
        };

        let sent = self.reliables.lock().unwrap().remove(&(header.channel, sequence));
        let Some(sent) = sent else {
            trace!(
                "ack for unknown or already settled channel {} seq {}",
                header.channel, sequence
            );
            return;
        };

        sent.acknowledged.store(true, Ordering::Release);
        sent.cancel.cancel();

        // only a first-attempt message acknowledged on its first receipt
        // yields a clean RTT sample; retransmissions are ambiguous
        if sent.attempts() != 0 || header.attempt != 0 {
            return;
        }
        let (Some(ack_created), Some(ack_sent)) = (header.created_ticks, packet_header.sent_ticks)
        else {
            return;
        };

        let now = self.ctx.clock.tick_slice();
        let elapsed = slice_delta(now, sent.created_slice) as i32;
        let remote_hold = slice_delta(ack_sent, ack_created) as i32;
        let rtt = elapsed - remote_hold;
        if !(0..32768).contains(&rtt) {
            debug!("discarding implausible rtt sample of {} ms", rtt);
            return;
        }

        let delta = ack_sent
            .wrapping_add((rtt / 2) as u16)
            .wrapping_sub(now);
        self.update_rtt(rtt as u16, delta);
        self.listener.on_update_rtt(self.clone(), rtt as u16).await;
    }
}

#[cfg(test)]
mod tests {
    use crate::config::PeerConfig;
    use crate::events::MockPeerListener;
    use crate::host::MockSendSocket;
    use crate::message::OutgoingMessage;
    use crate::peer::test_peer;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::runtime::Builder;

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn quick_config() -> PeerConfig {
        PeerConfig {
            send_delay: Duration::from_millis(10),
            ping_delay: Duration::from_secs(3600),
            ..PeerConfig::default()
        }
    }

    #[test]
    fn test_custom_message_reaches_the_listener() {
        let mut listener = MockPeerListener::new();
        listener
            .expect_on_receive()
            .once()
            .withf(|_, payload, info| payload.as_ref() == b"data" && info.channel == 0)
            .returning(|_, _, _| ());

        paused_runtime().block_on(async move {
            let peer = test_peer(
                Arc::new(MockSendSocket::new()),
                quick_config(),
                Arc::new(listener),
                false,
            );
            // CONNECTED, plain CUSTOM message
            peer.on_receive(&[0x04, 0x00, b'd', b'a', b't', b'a']).await;

            assert_eq!(peer.statistics().messages_received(), 1);
        });
    }

    #[test]
    fn test_ack_settles_a_reliable_message_and_samples_rtt() {
        let mut socket = MockSendSocket::new();
        socket.expect_send_packet().returning(|_, _| Ok(()));

        let mut listener = MockPeerListener::new();
        listener.expect_on_update_rtt().once().returning(|_, _| ());

        paused_runtime().block_on(async move {
            let config = PeerConfig {
                resend_delay_min: Duration::from_secs(60),
                resend_delay_max: Duration::from_secs(60),
                ..quick_config()
            };
            let peer = test_peer(Arc::new(socket), config, Arc::new(listener), false);
            let sent = peer.send(OutgoingMessage::new("q").reliable()).await.unwrap();
            assert_eq!(sent.sequence(), Some(1));

            // TIMED ack packet echoing (channel 0, seq 1, attempt 0)
            peer.on_receive(&[
                0x14, 0, 0, // CONNECTED | TIMED, sent ticks
                0x8d, 0, 0, // ACKNOWLEDGE | TIMED | RELIABLE | SEQUENCED, created ticks
                1, 0, // sequence
                0, // attempt
            ])
            .await;

            assert!(sent.acknowledged());
            assert!(peer.reliables.lock().unwrap().is_empty());
            assert!(peer.rtt_ms() < 500);
        });
    }

    #[test]
    fn test_duplicate_unique_message_is_suppressed_but_acknowledged() {
        let mut socket = MockSendSocket::new();
        // acks for both receptions go out
        socket.expect_send_packet().returning(|_, _| Ok(()));

        let mut listener = MockPeerListener::new();
        listener.expect_on_receive().once().returning(|_, _, _| ());

        paused_runtime().block_on(async move {
            let peer = test_peer(
                Arc::new(socket),
                quick_config(),
                Arc::new(listener),
                false,
            );

            // CUSTOM | RELIABLE | UNIQUE | SEQUENCED, channel 0, seq 1
            let record = [0x04, 0xa8, 1, 0, 0, b'v'];
            peer.on_receive(&record).await;
            peer.on_receive(&record).await;
            tokio::time::sleep(Duration::from_millis(50)).await;

            assert_eq!(peer.statistics().message_receive_duplicated(), 1);
            assert_eq!(peer.statistics().messages_received(), 2);
        });
    }

    #[test]
    fn test_lost_estimator_counts_gaps_and_late_arrivals() {
        paused_runtime().block_on(async move {
            let peer = test_peer(
                Arc::new(MockSendSocket::new()),
                quick_config(),
                Arc::new(MockPeerListener::new()),
                false,
            );

            peer.account_receive_sequence(2, 1);
            assert_eq!(peer.lost_messages(), 0);

            // 2 and 3 never arrive
            peer.account_receive_sequence(2, 4);
            assert_eq!(peer.lost_messages(), 2);

            // one of them shows up late after all
            peer.account_receive_sequence(2, 2);
            assert_eq!(peer.lost_messages(), 1);

            // other channels are unaffected
            peer.account_receive_sequence(3, 1);
            assert_eq!(peer.lost_messages(), 1);
            assert_eq!(peer.statistics().snapshot().message_receive_lost, 1);
        });
    }

    #[test]
    fn test_malformed_record_is_isolated() {
        let mut listener = MockPeerListener::new();
        listener.expect_on_exception().once().returning(|_, _| ());

        paused_runtime().block_on(async move {
            let peer = test_peer(
                Arc::new(MockSendSocket::new()),
                quick_config(),
                Arc::new(listener),
                false,
            );
            // SEQUENCED flag but the sequence bytes are missing
            peer.on_receive(&[0x04, 0x80, 1]).await;

            assert!(!peer.is_disposed());
        });
    }
}
