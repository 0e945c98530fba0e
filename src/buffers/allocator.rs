//! Pooled byte buffers.
//!
//! Packet assembly and the receive loops churn through short-lived buffers at
//! datagram rate; the allocator keeps a bounded pool of them so the steady
//! state allocates nothing.

use bytes::BytesMut;
use std::sync::Mutex;
use tracing::{debug, trace};

pub struct Allocator {
    pooled_length: usize,
    pooled_expand_length: usize,
    expand_length: usize,
    max_length: usize,
    buffers: Mutex<Vec<BytesMut>>,
}

impl Allocator {
    /// `count` bounds how many buffers are retained; buffers returned beyond
    /// that are dropped. `pooled_length` is the capacity buffers are created
    /// with, `pooled_expand_length`/`expand_length` the granularity for
    /// requests that exceed it, `max_length` a hard cap on any request.
    pub fn new(
        count: usize,
        pooled_length: usize,
        pooled_expand_length: usize,
        expand_length: usize,
        max_length: usize,
    ) -> Allocator {
        Allocator {
            pooled_length,
            pooled_expand_length,
            expand_length,
            max_length,
            buffers: Mutex::new(Vec::with_capacity(count)),
        }
    }

    /// An empty buffer with at least `min_capacity` bytes of capacity.
    ///
    /// Requests up to `pooled_length` are served from the pool when possible;
    /// larger ones are rounded up to the expand granularity and allocated
    /// fresh.
    pub fn byte_buffer(&self, min_capacity: usize) -> BytesMut {
        assert!(min_capacity <= self.max_length,
            "buffer request of {} bytes exceeds the configured maximum of {}",
            min_capacity, self.max_length);

        if min_capacity <= self.pooled_length {
            if let Some(buffer) = self.buffers.lock().unwrap().pop() {
                trace!("returning buffer from pool");
                return buffer;
            }
            debug!("no buffer in pool: creating new buffer");
            return BytesMut::with_capacity(self.pooled_length.max(self.pooled_expand_length));
        }

        let rounded = min_capacity.div_ceil(self.expand_length) * self.expand_length;
        BytesMut::with_capacity(rounded.min(self.max_length))
    }

    /// Hand a buffer back. Oversized or undersized buffers (capacity changed
    /// by growth or split-off) and buffers in excess of the pool bound are
    /// dropped instead of retained.
    pub fn recycle(&self, mut buffer: BytesMut) {
        if buffer.capacity() < self.pooled_length {
            trace!("discarding shrunken buffer");
            return;
        }
        buffer.clear();

        let mut buffers = self.buffers.lock().unwrap();
        if buffers.len() < buffers.capacity() {
            trace!("returning buffer to pool");
            buffers.push(buffer);
        } else {
            debug!("pool is full: discarding returned buffer");
        }
    }

    #[cfg(test)]
    fn pooled(&self) -> usize {
        self.buffers.lock().unwrap().len()
    }
}
