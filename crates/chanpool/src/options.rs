//! Per-operation options for `listen`, `connect` and `import`.

use std::time::Duration;

use chanpool_core::SourceId;

/// What happens when the peer closes its sending half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HalfOpenMode {
    /// Peer EOF takes the channel down (`DownReason::PeerClosed`).
    #[default]
    CloseBoth,
    /// Peer EOF emits `ReadClosed`; the channel stays up for writing
    /// until it is shut down or a write fails.
    KeepHalfOpen,
}

/// How to close a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Stop reading, send what is buffered, then close.
    Graceful,
    /// Close now; buffered outbound bytes are discarded.
    Immediate,
    /// Stop reading and shut the receiving half; the channel keeps
    /// writing.
    Read,
    /// Send what is buffered, then shut the sending half so the peer
    /// sees end of stream; the channel keeps reading.
    Write,
}

/// Options shared by every way of creating a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChannelOptions {
    pub read_enabled: bool,
    pub half_open: HalfOpenMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenOptions {
    /// Start accepted channels with auto-read on.
    pub read_enabled: bool,
    pub half_open: HalfOpenMode,
    /// Report `PoolEvent::AcceptTimeout` when no connection arrives for
    /// this long.
    pub accept_timeout: Option<Duration>,
    /// Event manager that owns the listener. `None` picks one round-robin.
    pub manager_hint: Option<usize>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self {
            read_enabled: true,
            half_open: HalfOpenMode::CloseBoth,
            accept_timeout: None,
            manager_hint: None,
        }
    }
}

impl ListenOptions {
    pub(crate) fn channel(&self) -> ChannelOptions {
        ChannelOptions {
            read_enabled: self.read_enabled,
            half_open: self.half_open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Tag reported with every event of the channel.
    pub source_id: SourceId,
    /// Give up with `DownReason::ConnectTimeout` after this long.
    /// `None` uses `PoolConfig::connect_timeout`.
    pub timeout: Option<Duration>,
    /// Delay between attempts. `None` uses
    /// `PoolConfig::connect_retry_interval`.
    pub retry_interval: Option<Duration>,
    /// Stop with `DownReason::ConnectFailed` after this many attempts.
    pub max_attempts: Option<u32>,
    pub read_enabled: bool,
    pub half_open: HalfOpenMode,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            source_id: SourceId::default(),
            timeout: None,
            retry_interval: None,
            max_attempts: None,
            read_enabled: true,
            half_open: HalfOpenMode::CloseBoth,
        }
    }
}

impl ConnectOptions {
    pub fn with_source(source_id: SourceId) -> Self {
        Self {
            source_id,
            ..Self::default()
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = Some(interval);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub(crate) fn channel(&self) -> ChannelOptions {
        ChannelOptions {
            read_enabled: self.read_enabled,
            half_open: self.half_open,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportOptions {
    pub source_id: SourceId,
    pub read_enabled: bool,
    pub half_open: HalfOpenMode,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            source_id: SourceId::default(),
            read_enabled: true,
            half_open: HalfOpenMode::CloseBoth,
        }
    }
}

impl ImportOptions {
    pub(crate) fn channel(&self) -> ChannelOptions {
        ChannelOptions {
            read_enabled: self.read_enabled,
            half_open: self.half_open,
        }
    }
}
