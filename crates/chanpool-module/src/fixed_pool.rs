//! `FixedBufferPool` — bounded `BufferPool`.
//!
//! Pre-allocates `count` buffers at creation and never allocates again.
//! `acquire` pops from a lock-free `ArrayQueue`; once every buffer is
//! checked out it returns `None`, which writers see as backpressure.
//!
//! No dynamic scaling. Simple, predictable, safe.

use chanpool_core::{Buffer, BufferPool};

use crossbeam_queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct FixedBufferPool {
    free: ArrayQueue<Buffer>,
    buffer_size: usize,
    total: usize,
    in_use: AtomicUsize,
}

impl FixedBufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes each.
    pub fn new(buffer_size: usize, count: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let total = count.max(1);
        let free = ArrayQueue::new(total);
        for _ in 0..total {
            // Cannot fail: the queue was sized for exactly `total`.
            let _ = free.push(Buffer::with_capacity(buffer_size));
        }
        Self {
            free,
            buffer_size,
            total,
            in_use: AtomicUsize::new(0),
        }
    }

    /// Buffers available right now.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

impl BufferPool for FixedBufferPool {
    fn acquire(&self) -> Option<Buffer> {
        let buffer = self.free.pop()?;
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }

    fn release(&self, buffer: Buffer) {
        if buffer.capacity() != self.buffer_size {
            return;
        }
        if self.free.push(buffer).is_ok() {
            self.in_use.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    fn limit(&self) -> Option<usize> {
        Some(self.total)
    }
}
