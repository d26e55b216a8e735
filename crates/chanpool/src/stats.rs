//! Byte counters and handle statistics.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-channel byte counters, updated on the manager thread (reads and
/// writes) and on client threads (`bytes_requested`).
#[derive(Debug, Default)]
pub(crate) struct ChannelCounters {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub bytes_requested: AtomicU64,
}

impl ChannelCounters {
    #[inline]
    pub fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Snapshot returned by `ChannelPool::channel_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChannelStats {
    /// Bytes read from the socket.
    pub bytes_read: u64,
    /// Bytes handed to the socket.
    pub bytes_written: u64,
    /// Bytes accepted by `write`.
    pub bytes_requested: u64,
    /// Outbound bytes buffered right now.
    pub write_cache_size: usize,
    /// Largest outbound size seen since creation or the last reset.
    pub write_cache_max: usize,
}

/// Pool-wide totals.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub bytes_read: AtomicU64,
    pub bytes_written: AtomicU64,
    pub channels_opened: AtomicU64,
    pub channels_closed: AtomicU64,
}

impl PoolCounters {
    pub fn snapshot(&self, num_channels: usize) -> PoolStats {
        PoolStats {
            num_channels,
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            channels_opened: self.channels_opened.load(Ordering::Relaxed),
            channels_closed: self.channels_closed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Channels currently registered.
    pub num_channels: usize,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub channels_opened: u64,
    pub channels_closed: u64,
}

/// Load of one event manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub index: usize,
    /// Live channels assigned to this manager.
    pub num_channels: usize,
    /// Descriptors with a registered interest (channels and listeners).
    pub num_sockets: usize,
    pub num_timers: usize,
}
