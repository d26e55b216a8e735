//! # BufferChain — per-channel byte queue over pooled buffers
//!
//! ```text
//!   front                                      back
//!  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐
//!  │xxxx░░░░░░░░░░│ │░░░░░░░░░░░░░░│ │░░░░░░░░......│
//!  └──────────────┘ └──────────────┘ └──────────────┘
//!   ^head (consumed)                          ^tail (filled)
//! ```
//!
//! Bytes are appended at `tail` of the back buffer and consumed from
//! `head` of the front buffer. A buffer goes back to the pool as soon as
//! every byte in it has been consumed, or when the chain is cleared or
//! dropped. `total_bytes()` is kept as a running counter.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, IoSlice};
use std::sync::Arc;

use chanpool_core::{Buffer, BufferPool, Socket};

use crate::error::BufferError;

/// Maximum slices handed to one vectored write.
pub const MAX_IOVECS: usize = 64;

pub struct BufferChain {
    buffers: VecDeque<Buffer>,
    /// Consumed bytes in the front buffer.
    head: usize,
    /// Filled bytes in the back buffer.
    tail: usize,
    total: usize,
    pool: Arc<dyn BufferPool>,
}

impl BufferChain {
    pub fn new(pool: Arc<dyn BufferPool>) -> Self {
        Self {
            buffers: VecDeque::new(),
            head: 0,
            tail: 0,
            total: 0,
            pool,
        }
    }

    /// Bytes held by the chain.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        self.total
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    /// Buffers currently held.
    #[inline]
    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn back_space(&self) -> usize {
        self.buffers
            .back()
            .map_or(0, |back| back.capacity() - self.tail)
    }

    /// Append `data`. Every buffer needed is acquired before anything is
    /// copied; if the pool runs dry the chain is left untouched.
    pub fn append(&mut self, data: &[u8]) -> Result<(), BufferError> {
        if data.is_empty() {
            return Ok(());
        }

        let need = data.len().saturating_sub(self.back_space());
        let size = self.pool.buffer_size();
        let count = need.div_ceil(size);

        let mut fresh = Vec::with_capacity(count);
        for _ in 0..count {
            match self.pool.acquire() {
                Some(buffer) => fresh.push(buffer),
                None => {
                    for buffer in fresh {
                        self.pool.release(buffer);
                    }
                    return Err(BufferError::OutOfMemory);
                }
            }
        }

        let mut rest = data;
        if let Some(back) = self.buffers.back_mut() {
            let n = rest.len().min(back.capacity() - self.tail);
            back.as_mut_slice()[self.tail..self.tail + n].copy_from_slice(&rest[..n]);
            self.tail += n;
            rest = &rest[n..];
        }
        for mut buffer in fresh {
            let n = rest.len().min(buffer.capacity());
            buffer.as_mut_slice()[..n].copy_from_slice(&rest[..n]);
            rest = &rest[n..];
            self.buffers.push_back(buffer);
            self.tail = n;
        }

        self.total += data.len();
        Ok(())
    }

    /// Drop up to `max` bytes from the front, releasing emptied buffers.
    /// Returns the number of bytes dropped.
    pub fn consume(&mut self, max: usize) -> usize {
        let done = max.min(self.total);
        let mut left = done;

        while left > 0 {
            let end = if self.buffers.len() == 1 {
                self.tail
            } else {
                match self.buffers.front() {
                    Some(front) => front.capacity(),
                    None => break,
                }
            };
            let avail = end - self.head;
            if left < avail {
                self.head += left;
                left = 0;
            } else {
                left -= avail;
                self.pop_front();
            }
        }

        self.total -= done;
        done
    }

    fn pop_front(&mut self) {
        if let Some(buffer) = self.buffers.pop_front() {
            self.pool.release(buffer);
        }
        self.head = 0;
        if self.buffers.is_empty() {
            self.tail = 0;
        }
    }

    /// One `read` from `src` straight into the tail, acquiring a buffer
    /// when the back one is full. Returns what `read` returned; `Ok(0)` is
    /// end of stream. Fails with `OutOfMemory` when no buffer is available.
    pub fn fill_from<S: Socket + ?Sized>(&mut self, src: &mut S) -> io::Result<usize> {
        let fresh = self.back_space() == 0;
        if fresh {
            let buffer = self
                .pool
                .acquire()
                .ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
            self.buffers.push_back(buffer);
            self.tail = 0;
            if self.buffers.len() == 1 {
                self.head = 0;
            }
        }

        let tail = self.tail;
        let result = match self.buffers.back_mut() {
            Some(back) => src.read(&mut back.as_mut_slice()[tail..]),
            None => Ok(0),
        };

        match result {
            Ok(n) if n > 0 => {
                self.tail += n;
                self.total += n;
            }
            _ if fresh => {
                // Nothing landed in the new buffer; give it back.
                if let Some(buffer) = self.buffers.pop_back() {
                    self.pool.release(buffer);
                }
                self.tail = self.buffers.back().map_or(0, Buffer::capacity);
                if self.buffers.is_empty() {
                    self.head = 0;
                }
            }
            _ => {}
        }
        result
    }

    /// One vectored write of up to `MAX_IOVECS` front slices to `dst`;
    /// written bytes are consumed.
    pub fn write_to<S: Socket + ?Sized>(&mut self, dst: &mut S) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        let written = {
            let slices: Vec<IoSlice<'_>> = self.chunks().take(MAX_IOVECS).map(IoSlice::new).collect();
            dst.write_vectored(&slices)?
        };
        Ok(self.consume(written))
    }

    /// Readable slices, front to back.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let last = self.buffers.len().saturating_sub(1);
        self.buffers
            .iter()
            .enumerate()
            .map(move |(i, buffer)| {
                let start = if i == 0 { self.head } else { 0 };
                let end = if i == last { self.tail } else { buffer.capacity() };
                &buffer.as_slice()[start..end]
            })
            .filter(|chunk| !chunk.is_empty())
    }

    /// Copy bytes from the front into `dst` without consuming them.
    /// Returns the number copied.
    pub fn copy_to(&self, dst: &mut [u8]) -> usize {
        let mut copied = 0;
        for chunk in self.chunks() {
            if copied == dst.len() {
                break;
            }
            let n = chunk.len().min(dst.len() - copied);
            dst[copied..copied + n].copy_from_slice(&chunk[..n]);
            copied += n;
        }
        copied
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.total);
        for chunk in self.chunks() {
            out.extend_from_slice(chunk);
        }
        out
    }

    /// Release every buffer.
    pub fn clear(&mut self) {
        while let Some(buffer) = self.buffers.pop_front() {
            self.pool.release(buffer);
        }
        self.head = 0;
        self.tail = 0;
        self.total = 0;
    }
}

impl Drop for BufferChain {
    fn drop(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for BufferChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferChain")
            .field("total", &self.total)
            .field("buffers", &self.buffers.len())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}
