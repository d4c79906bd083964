//! Bounded pool of frame buffers
//!
//! Buffers are checked out by producers and returned by the consumer once a
//! frame has been sent. The pool never holds more than `capacity` buffers, so
//! a burst cannot leave a large idle allocation behind.

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free pool of reusable byte buffers
pub struct FramePool {
    buffers: ArrayQueue<Vec<u8>>,
    frame_bytes: usize,
    misses: AtomicU64,
}

impl FramePool {
    /// Create a pool pre-filled with `capacity` buffers of `frame_bytes` each
    pub fn new(capacity: usize, frame_bytes: usize) -> Self {
        let buffers = ArrayQueue::new(capacity.max(1));
        while buffers.push(Vec::with_capacity(frame_bytes)).is_ok() {}
        Self {
            buffers,
            frame_bytes,
            misses: AtomicU64::new(0),
        }
    }

    /// Take an empty buffer; allocates when the pool is exhausted
    pub fn checkout(&self) -> Vec<u8> {
        match self.buffers.pop() {
            Some(buf) => buf,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.frame_bytes)
            }
        }
    }

    /// Return a buffer; dropped if the pool is already full
    pub fn recycle(&self, mut buf: Vec<u8>) {
        if buf.capacity() < self.frame_bytes {
            return;
        }
        buf.clear();
        let _ = self.buffers.push(buf);
    }

    /// Buffers currently idle in the pool
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Checkouts that had to allocate
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
