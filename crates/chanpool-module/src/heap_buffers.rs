//! `HeapBufferPool` — default `BufferPool` implementation.
//!
//! Buffers are plain heap allocations. A freelist keeps up to
//! `retain` released buffers for reuse; beyond that they are freed.
//! `acquire` never fails.

use chanpool_core::{Buffer, BufferPool};

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct HeapBufferPool {
    /// Capacity of every buffer handed out.
    buffer_size: usize,
    /// Released buffers waiting for reuse.
    free: SegQueue<Buffer>,
    /// Maximum freelist length.
    retain: usize,
    /// Number of buffers currently in use (for diagnostics).
    in_use: AtomicUsize,
    /// Total allocated (for diagnostics).
    allocated: AtomicUsize,
}

impl HeapBufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self::with_retain(buffer_size, 1024)
    }

    pub fn with_retain(buffer_size: usize, retain: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            free: SegQueue::new(),
            retain,
            in_use: AtomicUsize::new(0),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Buffers allocated over the pool's lifetime.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    /// Buffers sitting in the freelist.
    pub fn idle(&self) -> usize {
        self.free.len()
    }
}

impl Default for HeapBufferPool {
    fn default() -> Self {
        Self::new(8192) // 8 KiB default
    }
}

impl BufferPool for HeapBufferPool {
    fn acquire(&self) -> Option<Buffer> {
        let buffer = match self.free.pop() {
            Some(buffer) => buffer,
            None => {
                self.allocated.fetch_add(1, Ordering::Relaxed);
                Buffer::with_capacity(self.buffer_size)
            }
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Some(buffer)
    }

    fn release(&self, buffer: Buffer) {
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        if buffer.capacity() == self.buffer_size && self.free.len() < self.retain {
            self.free.push(buffer);
        }
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}
