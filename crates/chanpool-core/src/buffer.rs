//! Buffer management abstraction.
//!
//! A `BufferPool` hands out fixed-capacity byte buffers for channel
//! read/write chains and takes them back once drained.
//!
//! # Implementors
//!
//! - `HeapBufferPool` (default): allocates on a freelist miss, never
//!   exhausts. Released buffers are recycled up to a retention cap.
//! - `FixedBufferPool`: pre-allocates a fixed number of buffers; `acquire`
//!   returns `None` once they are all checked out. Exhaustion surfaces to
//!   writers as backpressure.

/// An owned, fixed-capacity buffer.
///
/// Buffers carry no cursor of their own; `BufferChain` tracks how much of
/// each one is filled or consumed.
#[derive(Debug)]
pub struct Buffer {
    data: Box<[u8]>,
}

impl Buffer {
    /// Allocate a zeroed buffer of `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Manages buffer lifecycle.
///
/// **Contract:**
/// - `acquire()` returns a buffer of exactly `buffer_size()` bytes, or
///   `None` if the pool is exhausted and cannot grow. It never blocks.
/// - `release()` returns a buffer obtained from this pool.
/// - Both are safe to call concurrently from any thread.
pub trait BufferPool: Send + Sync {
    fn acquire(&self) -> Option<Buffer>;

    fn release(&self, buffer: Buffer);

    /// Capacity of every buffer this pool hands out.
    fn buffer_size(&self) -> usize;

    /// Buffers currently checked out.
    fn in_use(&self) -> usize;

    /// Upper bound on buffers, `None` for growable pools.
    fn limit(&self) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_capacity() {
        let mut buf = Buffer::with_capacity(16);
        assert_eq!(buf.capacity(), 16);
        buf.as_mut_slice()[0] = 7;
        assert_eq!(buf.as_slice()[0], 7);
    }
}
