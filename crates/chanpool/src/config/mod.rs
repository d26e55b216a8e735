//! Channel pool configuration
//!
//! Provides compile-time defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`new()`)
//!
//! # Example
//!
//! ```rust,ignore
//! use chanpool::config::PoolConfig;
//!
//! let config = PoolConfig::from_env()
//!     .num_event_managers(2)
//!     .watermarks(500_000, 1_000_000);
//! ```

pub mod defaults;

use std::str::FromStr;
use std::time::Duration;

use chanpool_core::env::{env_get, env_get_bool, env_get_millis, env_get_opt};
use chanpool_core::SocketOptions;

use crate::error::{PoolError, PoolResult};

/// How new channels are spread over event managers. Assignment is fixed
/// for the channel's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssignmentPolicy {
    #[default]
    RoundRobin,
    /// Manager with the fewest live channels at creation time.
    LeastLoaded,
}

impl FromStr for AssignmentPolicy {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" | "rr" => Ok(AssignmentPolicy::RoundRobin),
            "least_loaded" | "ll" => Ok(AssignmentPolicy::LeastLoaded),
            _ => Err(()),
        }
    }
}

/// Pool configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Event manager threads (fixed for the pool's lifetime)
    pub num_event_managers: usize,
    /// Writes are refused while buffered outbound bytes exceed this
    pub high_watermark: usize,
    /// `WritableAgain` fires once outbound drains to this
    pub low_watermark: usize,
    /// Live channel cap, `None` for unlimited
    pub max_connections: Option<usize>,
    /// `ReadTimeout` after this long without inbound bytes
    pub read_timeout: Option<Duration>,
    /// Read calls per readiness notification before yielding
    pub max_reads_per_turn: usize,
    /// Size of each pooled buffer
    pub buffer_size: usize,
    /// Bounded buffer pool size, `None` for a growable heap pool
    pub max_buffers: Option<usize>,
    /// Default `ConnectOptions::timeout`
    pub connect_timeout: Duration,
    /// Delay between connect attempts
    pub connect_retry_interval: Duration,
    /// First back-off after an accept error; doubles up to `accept_backoff_max`
    pub accept_backoff_min: Duration,
    pub accept_backoff_max: Duration,
    /// `SO_KEEPALIVE` on created and accepted sockets
    pub keep_alive: bool,
    /// `TCP_NODELAY` on created and accepted sockets
    pub no_delay: bool,
    pub assignment: AssignmentPolicy,
    /// `mio::Events` capacity per manager
    pub events_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolConfig {
    /// Create config from compile-time defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `CHANPOOL_NUM_MANAGERS` - Event manager threads
    /// - `CHANPOOL_HIGH_WATERMARK` - High-water mark in bytes
    /// - `CHANPOOL_LOW_WATERMARK` - Low-water mark in bytes
    /// - `CHANPOOL_MAX_CONNECTIONS` - Channel cap (0 = unlimited)
    /// - `CHANPOOL_READ_TIMEOUT_MS` - Read timeout (0 = none)
    /// - `CHANPOOL_MAX_READS_PER_TURN` - Reads per readiness notification
    /// - `CHANPOOL_BUFFER_SIZE` - Pooled buffer size
    /// - `CHANPOOL_MAX_BUFFERS` - Bounded pool size (0 = growable)
    /// - `CHANPOOL_CONNECT_TIMEOUT_MS` - Default connect timeout
    /// - `CHANPOOL_CONNECT_RETRY_MS` - Delay between connect attempts
    /// - `CHANPOOL_KEEP_ALIVE` - SO_KEEPALIVE (0/1)
    /// - `CHANPOOL_NO_DELAY` - TCP_NODELAY (0/1)
    /// - `CHANPOOL_ASSIGNMENT` - `round_robin` or `least_loaded`
    /// - `CHANPOOL_EVENTS_CAPACITY` - Events per poll
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            num_event_managers: env_get("CHANPOOL_NUM_MANAGERS", base.num_event_managers),
            high_watermark: env_get("CHANPOOL_HIGH_WATERMARK", base.high_watermark),
            low_watermark: env_get("CHANPOOL_LOW_WATERMARK", base.low_watermark),
            max_connections: non_zero(env_get(
                "CHANPOOL_MAX_CONNECTIONS",
                defaults::MAX_CONNECTIONS,
            )),
            read_timeout: env_get_millis("CHANPOOL_READ_TIMEOUT_MS").or(base.read_timeout),
            max_reads_per_turn: env_get("CHANPOOL_MAX_READS_PER_TURN", base.max_reads_per_turn),
            buffer_size: env_get("CHANPOOL_BUFFER_SIZE", base.buffer_size),
            max_buffers: non_zero(env_get("CHANPOOL_MAX_BUFFERS", defaults::MAX_BUFFERS)),
            connect_timeout: Duration::from_millis(env_get(
                "CHANPOOL_CONNECT_TIMEOUT_MS",
                defaults::CONNECT_TIMEOUT_MS,
            )),
            connect_retry_interval: Duration::from_millis(env_get(
                "CHANPOOL_CONNECT_RETRY_MS",
                defaults::CONNECT_RETRY_MS,
            )),
            accept_backoff_min: base.accept_backoff_min,
            accept_backoff_max: base.accept_backoff_max,
            keep_alive: env_get_bool("CHANPOOL_KEEP_ALIVE", base.keep_alive),
            no_delay: env_get_bool("CHANPOOL_NO_DELAY", base.no_delay),
            assignment: env_get_opt::<String>("CHANPOOL_ASSIGNMENT")
                .and_then(|name| name.parse().ok())
                .unwrap_or(base.assignment),
            events_capacity: env_get("CHANPOOL_EVENTS_CAPACITY", base.events_capacity),
        }
    }

    /// Create config with explicit defaults (no env override).
    /// Useful for testing or when you want full control.
    pub fn new() -> Self {
        Self {
            num_event_managers: defaults::NUM_EVENT_MANAGERS,
            high_watermark: defaults::HIGH_WATERMARK,
            low_watermark: defaults::LOW_WATERMARK,
            max_connections: non_zero(defaults::MAX_CONNECTIONS),
            read_timeout: (defaults::READ_TIMEOUT_MS > 0)
                .then(|| Duration::from_millis(defaults::READ_TIMEOUT_MS)),
            max_reads_per_turn: defaults::MAX_READS_PER_TURN,
            buffer_size: defaults::BUFFER_SIZE,
            max_buffers: non_zero(defaults::MAX_BUFFERS),
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            connect_retry_interval: Duration::from_millis(defaults::CONNECT_RETRY_MS),
            accept_backoff_min: Duration::from_millis(defaults::ACCEPT_BACKOFF_MIN_MS),
            accept_backoff_max: Duration::from_millis(defaults::ACCEPT_BACKOFF_MAX_MS),
            keep_alive: defaults::KEEP_ALIVE,
            no_delay: defaults::NO_DELAY,
            assignment: AssignmentPolicy::RoundRobin,
            events_capacity: defaults::EVENTS_CAPACITY,
        }
    }

    /// Set number of event manager threads
    pub fn num_event_managers(mut self, n: usize) -> Self {
        self.num_event_managers = n;
        self
    }

    /// Set low and high water marks for every new channel
    pub fn watermarks(mut self, low: usize, high: usize) -> Self {
        self.low_watermark = low;
        self.high_watermark = high;
        self
    }

    pub fn max_connections(mut self, max: Option<usize>) -> Self {
        self.max_connections = max;
        self
    }

    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn max_reads_per_turn(mut self, n: usize) -> Self {
        self.max_reads_per_turn = n;
        self
    }

    /// Set pooled buffer size and, optionally, a bound on their number
    pub fn buffers(mut self, size: usize, max: Option<usize>) -> Self {
        self.buffer_size = size;
        self.max_buffers = max;
        self
    }

    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn connect_retry_interval(mut self, d: Duration) -> Self {
        self.connect_retry_interval = d;
        self
    }

    pub fn keep_alive(mut self, enable: bool) -> Self {
        self.keep_alive = enable;
        self
    }

    pub fn assignment(mut self, policy: AssignmentPolicy) -> Self {
        self.assignment = policy;
        self
    }

    /// Socket options applied to created and accepted sockets.
    pub fn socket_options(&self) -> SocketOptions {
        SocketOptions {
            keep_alive: self.keep_alive,
            no_delay: self.no_delay,
            ..SocketOptions::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> PoolResult<()> {
        if self.num_event_managers == 0 {
            return Err(PoolError::InvalidConfig("num_event_managers must be at least 1"));
        }
        check_watermarks(self.low_watermark, self.high_watermark)?;
        if self.max_reads_per_turn == 0 {
            return Err(PoolError::InvalidConfig("max_reads_per_turn must be at least 1"));
        }
        if self.buffer_size == 0 {
            return Err(PoolError::InvalidConfig("buffer_size must be at least 1"));
        }
        if self.max_connections == Some(0) || self.max_buffers == Some(0) {
            return Err(PoolError::InvalidConfig("limits must be at least 1; use None for unlimited"));
        }
        if self.accept_backoff_min > self.accept_backoff_max {
            return Err(PoolError::InvalidConfig("accept_backoff_min exceeds accept_backoff_max"));
        }
        Ok(())
    }
}

/// Water marks must satisfy `low < high`.
pub(crate) fn check_watermarks(low: usize, high: usize) -> PoolResult<()> {
    if high <= low {
        return Err(PoolError::InvalidConfig("high_watermark must exceed low_watermark"));
    }
    Ok(())
}

fn non_zero(n: usize) -> Option<usize> {
    (n > 0).then_some(n)
}
