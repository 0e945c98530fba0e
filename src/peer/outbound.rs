//! The outgoing pipeline: aggregate, compress, encrypt, fragment, send.
//!
//! Messages enqueued within one `send_delay` window are coalesced into a
//! single datagram. The aggregation buffer always leaves
//! [`PacketHeader::MAX_SERIALIZED_LEN`] bytes of room in front of the first
//! message, so a single-message packet that needs neither compression nor
//! encryption is emitted without copying: the packet header is written
//! backwards into the reserved space, the length prefix is skipped and the
//! COMBINED flag stays clear.

use crate::error::TransportError;
use crate::events::DisconnectReason;
use crate::message::OutgoingMessage;
use crate::message_header::{MessageFlags, MessageHeader, MessageType};
use crate::packet_header::{FragmentInfo, PacketFlags, PacketHeader, PacketType};
use crate::peer::Peer;
use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

const RESERVED_PREFIX: usize = PacketHeader::MAX_SERIALIZED_LEN;

/// Handle returned from [`Peer::send`]. For reliable messages it doubles as
/// the resend-loop state; the invariant is that a reliable message sits in
/// the peer's reliables map iff it is neither acknowledged nor timed out.
pub struct SentMessage {
    pub(crate) payload: Bytes,
    pub(crate) flags: MessageFlags,
    pub(crate) message_type: MessageType,
    pub(crate) channel: u8,
    pub(crate) sequence: Option<u16>,
    /// Tick slice taken when the message was enqueued; the base of the RTT
    /// derivation when the first attempt is acknowledged.
    pub(crate) created_slice: u16,
    pub(crate) attempts: AtomicU8,
    pub(crate) acknowledged: AtomicBool,
    /// Child of the peer's dispose token; also collapsed by the ack.
    pub(crate) cancel: CancellationToken,
}

impl SentMessage {
    pub fn channel(&self) -> u8 {
        self.channel
    }

    pub fn sequence(&self) -> Option<u16> {
        self.sequence
    }

    /// Emissions so far minus one; 0 while only the original send is out.
    pub fn attempts(&self) -> u8 {
        self.attempts.load(Ordering::Relaxed)
    }

    pub fn acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    fn header(&self) -> MessageHeader {
        let mut header = MessageHeader::new(self.message_type, self.flags, self.channel)
            .with_attempt(self.attempts());
        if self.flags.contains(MessageFlags::TIMED) {
            header = header.with_created_ticks(self.created_slice);
        }
        if let Some(sequence) = self.sequence {
            header = header.with_sequence(sequence);
        }
        header
    }
}

pub(crate) struct OutboundState {
    pub(crate) buffer: BytesMut,
    pub(crate) message_count: u32,
    pub(crate) timed: bool,
    pub(crate) flush_task: Option<JoinHandle<()>>,
}

impl OutboundState {
    pub(crate) fn new() -> OutboundState {
        OutboundState {
            buffer: BytesMut::new(),
            message_count: 0,
            timed: false,
            flush_task: None,
        }
    }
}

/// Append one `(u32 length, header, payload)` record to an aggregation
/// buffer, reserving the header prefix in front of the first record.
pub(crate) fn append_record(buffer: &mut BytesMut, header: &MessageHeader, payload: &[u8]) {
    if buffer.is_empty() {
        buffer.put_bytes(0, RESERVED_PREFIX);
    }
    buffer.put_u32_le((header.serialized_len() + payload.len()) as u32);
    header.ser(buffer);
    buffer.put_slice(payload);
}

impl Peer {
    /// Allocate a sequence when the message needs one: always for
    /// reliable/ordered/unique, and otherwise once the channel's unsequenced
    /// run exceeds `unsequenced_max`, so the receiver's loss estimator never
    /// drifts without a reference point.
    fn allocate_sequence(&self, channel: u8, flags: MessageFlags) -> Option<u16> {
        if flags.needs_sequence() {
            self.unsequenced_runs.store(channel, 0);
            return Some(self.send_sequences.bump(channel));
        }
        if self.unsequenced_runs.bump(channel) > self.config.unsequenced_max {
            self.unsequenced_runs.store(channel, 0);
            return Some(self.send_sequences.bump(channel));
        }
        None
    }

    pub(crate) async fn send_message(
        self: &Arc<Self>,
        message_type: MessageType,
        message: OutgoingMessage,
    ) -> Result<Arc<SentMessage>, TransportError> {
        let mut flags = message.base_flags();
        let channel = message.channel;

        let sequence = self.allocate_sequence(channel, flags);
        if sequence.is_some() {
            flags |= MessageFlags::SEQUENCED;
        }

        let sent = Arc::new(SentMessage {
            payload: message.payload,
            flags,
            message_type,
            channel,
            sequence,
            created_slice: self.ctx.clock.tick_slice(),
            attempts: AtomicU8::new(0),
            acknowledged: AtomicBool::new(false),
            cancel: self.dispose_token.child_token(),
        });

        if flags.contains(MessageFlags::RELIABLE) {
            let sequence = sequence.expect("reliable messages are always sequenced");
            self.reliables.lock().unwrap().insert((channel, sequence), sent.clone());
            self.spawn_resend_loop(sent.clone());
        }

        self.enqueue_record(&sent.header(), &sent.payload);
        self.statistics.add_messages_sent(1);
        self.ctx.host_statistics.add_messages_sent(1);

        Ok(sent)
    }

    /// Keep-alives are ordinary reliable messages on channel 0: their acks
    /// feed the RTT estimator and their resend loop detects a dead remote.
    pub(crate) async fn send_ping(self: &Arc<Self>) {
        let ping = OutgoingMessage::new(Bytes::new()).reliable().timed();
        if let Err(e) = self.send_message(MessageType::Ping, ping).await {
            debug!("ping not sent: {}", e);
        }
    }

    pub(crate) async fn send_disconnect_notice(self: &Arc<Self>) {
        let notice = OutgoingMessage::new(Bytes::new());
        if self
            .send_message(MessageType::Disconnect, notice)
            .await
            .is_ok()
        {
            self.flush_now().await;
        }
    }

    /// Receipt for a reliable message, echoing its coordinates and attempt
    /// so the sender can correlate and derive the RTT. Not tracked in the
    /// reliables map - an ack is never itself acknowledged.
    pub(crate) fn enqueue_ack(self: &Arc<Self>, channel: u8, sequence: u16, attempt: u8) {
        let header = MessageHeader::new(
            MessageType::Acknowledge,
            MessageFlags::RELIABLE | MessageFlags::SEQUENCED | MessageFlags::TIMED,
            channel,
        )
        .with_sequence(sequence)
        .with_created_ticks(self.ctx.clock.tick_slice())
        .with_attempt(attempt);

        self.enqueue_record(&header, &[]);
    }

    /// Put a record into the aggregation buffer and make sure a flush task
    /// is pending. The flush task is started at most once per window.
    pub(crate) fn enqueue_record(self: &Arc<Self>, header: &MessageHeader, payload: &[u8]) {
        let mut outbound = self.outbound.lock().unwrap();
        append_record(&mut outbound.buffer, header, payload);
        outbound.message_count += 1;
        if header.flags.contains(MessageFlags::TIMED) {
            outbound.timed = true;
        }

        if outbound.flush_task.is_none() {
            let peer = self.clone();
            outbound.flush_task = Some(tokio::spawn(async move {
                tokio::select! {
                    _ = peer.dispose_token.cancelled() => return,
                    _ = tokio::time::sleep(peer.config.send_delay) => {}
                }
                peer.flush().await;
            }));
        }
    }

    /// Cancel a pending flush window and emit what is queued right away.
    pub(crate) async fn flush_now(self: &Arc<Self>) {
        if let Some(task) = self.outbound.lock().unwrap().flush_task.take() {
            task.abort();
        }
        self.flush().await;
    }

    pub(crate) async fn flush(self: &Arc<Self>) {
        let (buffer, count, timed) = {
            let mut outbound = self.outbound.lock().unwrap();
            outbound.flush_task = None;
            if outbound.message_count == 0 {
                return;
            }
            let buffer = std::mem::take(&mut outbound.buffer);
            let count = std::mem::take(&mut outbound.message_count);
            let timed = std::mem::take(&mut outbound.timed);
            (buffer, count, timed)
        };

        if let Err(e) = self.assemble_and_send(buffer, count, timed).await {
            self.report_exception(e).await;
        }
    }

    /// Turn one aggregation buffer into one logical packet: compress and
    /// encrypt the message region, then emit it as one datagram or a run of
    /// fragments.
    async fn assemble_and_send(
        self: &Arc<Self>,
        mut buffer: BytesMut,
        count: u32,
        timed: bool,
    ) -> Result<(), TransportError> {
        let mut flags = PacketFlags::empty();
        if self.ctx.crc32 {
            flags |= PacketFlags::VERIFIED;
        }
        if count > 1 {
            flags |= PacketFlags::COMBINED;
        }

        // a single message elides its length prefix
        let region_start = if count > 1 { RESERVED_PREFIX } else { RESERVED_PREFIX + 4 };

        let mut transformed: Option<Vec<u8>> = None;
        if let Some(compressor) = &self.ctx.compressor {
            let region = &buffer[region_start..];
            if region.len() >= 64 {
                let compressed = compressor.compress(region)?;
                if compressed.len() < region.len() {
                    trace!("compressed packet from {} to {} bytes", region.len(), compressed.len());
                    flags |= PacketFlags::COMPRESSED;
                    transformed = Some(compressed);
                }
            }
        }
        if let Some(cipher) = self.cipher() {
            let plain = transformed.as_deref().unwrap_or(&buffer[region_start..]);
            transformed = Some(cipher.encrypt(plain)?);
        }

        let sent_ticks = timed.then(|| self.ctx.clock.tick_slice());
        let base_header = {
            let mut header = PacketHeader::new(PacketType::Connected, flags);
            if let Some(ticks) = sent_ticks {
                header = header.with_sent_ticks(ticks);
            }
            header
        };

        let region_len = transformed.as_ref().map(Vec::len).unwrap_or(buffer.len() - region_start);
        if base_header.serialized_len() + region_len <= self.config.mtu {
            match transformed {
                None => {
                    // in-place emission: header goes into the reserved prefix
                    let header_len = base_header.serialized_len();
                    let packet_start = region_start - header_len;
                    let mut header_buf = &mut buffer[packet_start..region_start];
                    base_header.ser(&mut header_buf);
                    PacketHeader::patch_crc(&mut buffer[packet_start..]);

                    self.send_datagram(&buffer[packet_start..]).await;
                }
                Some(region) => {
                    let mut packet =
                        self.ctx.allocator.byte_buffer(base_header.serialized_len() + region.len());
                    base_header.ser(&mut packet);
                    packet.put_slice(&region);
                    PacketHeader::patch_crc(&mut packet);

                    self.send_datagram(&packet).await;
                    self.ctx.allocator.recycle(packet);
                }
            }
            self.ctx.allocator.recycle(buffer);
            return Ok(());
        }

        // fragmentation path
        let region: &[u8] = transformed.as_deref().unwrap_or(&buffer[region_start..]);
        let fragment_overhead = base_header.serialized_len() + 6;
        let part_capacity = self
            .config
            .mtu
            .checked_sub(fragment_overhead)
            .ok_or_else(|| TransportError::malformed("MTU below fragment overhead"))?;
        let parts = region.len().div_ceil(part_capacity);
        if parts > u16::MAX as usize + 1 {
            return Err(TransportError::Malformed(format!(
                "packet of {} bytes needs {} fragments",
                region.len(),
                parts
            )));
        }

        let fragment_id = self.fragment_ids.fetch_add(1, Ordering::Relaxed);
        let last_part = (parts - 1) as u16;
        debug!("fragmenting {} byte packet into {} parts as #{}", region.len(), parts, fragment_id);

        for (index, chunk) in region.chunks(part_capacity).enumerate() {
            let header = base_header.clone().with_fragment(FragmentInfo {
                fragment_id,
                part: index as u16,
                last_part,
            });

            let mut packet = self.ctx.allocator.byte_buffer(header.serialized_len() + chunk.len());
            header.ser(&mut packet);
            packet.put_slice(chunk);
            PacketHeader::patch_crc(&mut packet);

            self.send_datagram(&packet).await;
            self.statistics.add_fragments_sent(1);
            self.ctx.allocator.recycle(packet);
        }

        self.ctx.allocator.recycle(buffer);
        Ok(())
    }

    /// Resends run outside the flush path: each emission re-enqueues the
    /// record with its attempt counter baked in, so the receiver can
    /// classify duplicates and the sender can match acks to attempts.
    pub(crate) fn spawn_resend_loop(self: &Arc<Self>, sent: Arc<SentMessage>) {
        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = peer.resend_delay();
                tokio::select! {
                    _ = sent.cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                if sent.acknowledged() {
                    return;
                }

                let emissions = sent.attempts() as u32 + 1;
                if emissions >= peer.config.resend_count {
                    debug!(
                        "message on channel {} seq {:?} timed out after {} attempts",
                        sent.channel, sent.sequence, emissions
                    );
                    if let Some(sequence) = sent.sequence {
                        peer.reliables.lock().unwrap().remove(&(sent.channel, sequence));
                    }
                    peer.terminate(
                        DisconnectReason::Timeout,
                        None,
                        Some(TransportError::Timeout),
                    )
                    .await;
                    return;
                }

                sent.attempts.fetch_add(1, Ordering::Relaxed);
                peer.statistics.add_messages_resent(1);
                trace!(
                    "resending channel {} seq {:?}, attempt {}",
                    sent.channel, sent.sequence, sent.attempts()
                );
                peer.enqueue_record(&sent.header(), &sent.payload);
            }
        });
    }

    /// Resend delay: the measured RTT plus jitter, clamped into the
    /// configured window.
    fn resend_delay(&self) -> std::time::Duration {
        let jitter_ms = self.config.resend_delay_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 { 0 } else { rand::thread_rng().gen_range(0..=jitter_ms) };
        let raw = std::time::Duration::from_millis(self.rtt_ms() as u64 + jitter);
        raw.clamp(self.config.resend_delay_min, self.config.resend_delay_max)
    }
}
