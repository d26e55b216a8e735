//! Library defaults for `PoolConfig`.

/// Event manager threads
pub const NUM_EVENT_MANAGERS: usize = 4;

/// Outbound bytes above which writes are refused
pub const HIGH_WATERMARK: usize = 1 << 20;

/// Outbound bytes at or below which `WritableAgain` fires
pub const LOW_WATERMARK: usize = 1 << 18;

/// 0 = unlimited
pub const MAX_CONNECTIONS: usize = 0;

/// 0 = no read timeout
pub const READ_TIMEOUT_MS: u64 = 0;

pub const MAX_READS_PER_TURN: usize = 16;

pub const BUFFER_SIZE: usize = 8192;

/// 0 = growable heap pool
pub const MAX_BUFFERS: usize = 0;

pub const CONNECT_TIMEOUT_MS: u64 = 5_000;

pub const CONNECT_RETRY_MS: u64 = 100;

pub const ACCEPT_BACKOFF_MIN_MS: u64 = 10;

pub const ACCEPT_BACKOFF_MAX_MS: u64 = 1_000;

pub const KEEP_ALIVE: bool = false;

pub const NO_DELAY: bool = true;

pub const EVENTS_CAPACITY: usize = 1024;
