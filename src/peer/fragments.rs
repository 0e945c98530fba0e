//! Reassembly of fragmented packets.
//!
//! A peer keeps exactly one fragment assembly in flight: the first part of a
//! new fragment id replaces whatever was under way. Non-last parts must all
//! share one length (the last may be shorter), duplicate parts are detected
//! by the per-part bitfield, and a single timeout task discards a stalled
//! assembly after `fragment_timeout`.

use crate::error::TransportError;
use crate::packet_header::FragmentInfo;
use crate::peer::Peer;
use bytes::{BufMut, Bytes, BytesMut};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub(crate) struct FragmentReassembly {
    current: Option<Assembly>,
    timeout_task: Option<JoinHandle<()>>,
}

impl FragmentReassembly {
    pub(crate) fn new() -> FragmentReassembly {
        FragmentReassembly { current: None, timeout_task: None }
    }
}

struct Assembly {
    fragment_id: u16,
    last_part: u16,
    /// Length shared by all non-last parts; pinned by the first of them.
    part_length: Option<usize>,
    parts: Vec<Option<Bytes>>,
    received: usize,
}

impl Assembly {
    fn new(fragment_id: u16, last_part: u16) -> Assembly {
        Assembly {
            fragment_id,
            last_part,
            part_length: None,
            parts: vec![None; last_part as usize + 1],
            received: 0,
        }
    }

    /// Returns the reassembled packet once every part is present, `None`
    /// while parts are missing or for duplicate parts.
    fn integrate(
        &mut self,
        info: &FragmentInfo,
        bytes: &[u8],
        max_length: usize,
    ) -> Result<Option<Bytes>, TransportError> {
        if info.last_part != self.last_part {
            return Err(TransportError::Malformed(format!(
                "fragment #{} changed its part count from {} to {}",
                self.fragment_id, self.last_part, info.last_part
            )));
        }

        let index = info.part as usize;
        if self.parts[index].is_some() {
            trace!("duplicate part {} of fragment #{}", info.part, self.fragment_id);
            return Ok(None);
        }

        if info.part < self.last_part {
            match self.part_length {
                None => {
                    if bytes.len().saturating_mul(self.last_part as usize + 1) > max_length {
                        return Err(TransportError::Malformed(format!(
                            "fragment #{} would reassemble beyond {} bytes",
                            self.fragment_id, max_length
                        )));
                    }
                    self.part_length = Some(bytes.len());
                }
                Some(expected) if expected != bytes.len() => {
                    return Err(TransportError::Malformed(format!(
                        "part {} of fragment #{} has {} bytes, expected {}",
                        info.part,
                        self.fragment_id,
                        bytes.len(),
                        expected
                    )));
                }
                Some(_) => {}
            }
        } else if let Some(expected) = self.part_length {
            if bytes.len() > expected {
                return Err(TransportError::Malformed(format!(
                    "last part of fragment #{} is longer than the others",
                    self.fragment_id
                )));
            }
        }

        self.parts[index] = Some(Bytes::copy_from_slice(bytes));
        self.received += 1;

        if self.received <= self.last_part as usize {
            return Ok(None);
        }

        let total = self.parts.iter().map(|p| p.as_ref().map_or(0, Bytes::len)).sum();
        let mut assembled = BytesMut::with_capacity(total);
        for part in &self.parts {
            assembled.put_slice(part.as_ref().expect("all parts received"));
        }
        Ok(Some(assembled.freeze()))
    }
}

impl Peer {
    /// Fold one part into the in-progress assembly; returns the full packet
    /// when this part completed it.
    pub(crate) fn integrate_fragment(
        self: &Arc<Self>,
        info: &FragmentInfo,
        bytes: &[u8],
    ) -> Result<Option<Bytes>, TransportError> {
        self.statistics.add_fragments_received(1);

        let mut reassembly = self.fragments.lock().unwrap();

        let stale = match &reassembly.current {
            Some(assembly) => assembly.fragment_id != info.fragment_id,
            None => true,
        };
        if stale {
            if let Some(previous) = &reassembly.current {
                debug!(
                    "fragment #{} replaces incomplete fragment #{}",
                    info.fragment_id, previous.fragment_id
                );
            }
            reassembly.current = Some(Assembly::new(info.fragment_id, info.last_part));
            self.restart_fragment_timeout(&mut reassembly, info.fragment_id);
        }

        let assembly = reassembly.current.as_mut().expect("assembly installed above");
        let completed = assembly.integrate(info, bytes, self.ctx.max_packet_length)?;

        if completed.is_some() {
            reassembly.current = None;
            if let Some(task) = reassembly.timeout_task.take() {
                task.abort();
            }
        }
        Ok(completed)
    }

    fn restart_fragment_timeout(
        self: &Arc<Self>,
        reassembly: &mut FragmentReassembly,
        fragment_id: u16,
    ) {
        if let Some(task) = reassembly.timeout_task.take() {
            task.abort();
        }

        let peer = self.clone();
        reassembly.timeout_task = Some(tokio::spawn(async move {
            tokio::select! {
                _ = peer.dispose_token.cancelled() => return,
                _ = tokio::time::sleep(peer.config.fragment_timeout) => {}
            }

            let mut reassembly = peer.fragments.lock().unwrap();
            let timed_out = matches!(&reassembly.current,
                Some(assembly) if assembly.fragment_id == fragment_id);
            if timed_out {
                debug!("fragment #{} timed out incomplete", fragment_id);
                reassembly.current = None;
            }
        }));
    }
}
