//! Pool error types.

use std::io;
use std::net::SocketAddr;

use chanpool_core::{AcceptorId, ChannelId, ClockId, CoreError};
use thiserror::Error;

/// Errors returned by the public `ChannelPool` API.
///
/// Channel-scoped failures (socket errors, peer reset, connect timeout)
/// are never returned here; they close the channel and surface as a
/// `Down` event with a [`DownReason`](crate::event::DownReason).
#[derive(Debug, Error)]
pub enum PoolError {
    /// Rejected configuration or argument.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    /// The id does not name a live channel.
    #[error("channel {0} not found")]
    InvalidChannel(ChannelId),
    /// Unknown acceptor id.
    #[error("acceptor {0} not found")]
    InvalidAcceptor(AcceptorId),
    /// Backpressure is engaged, buffers ran out, or a per-call enqueue
    /// watermark was exceeded.
    #[error("write refused: channel {0} is backpressured")]
    Backpressure(ChannelId),
    #[error("address {0} already in use")]
    AddressInUse(SocketAddr),
    /// `max_connections` reached.
    #[error("channel limit reached")]
    ChannelLimit,
    #[error("clock {0} already registered")]
    ClockExists(ClockId),
    #[error("clock {0} not found")]
    InvalidClock(ClockId),
    /// The pool (or the channel's event manager) was stopped.
    #[error("channel pool stopped")]
    Stopped,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<CoreError> for PoolError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::Stopped => PoolError::Stopped,
            CoreError::Register { source, .. } => PoolError::Io(source),
            CoreError::Poll(source) => PoolError::Io(source),
            CoreError::Io(source) => PoolError::Io(source),
        }
    }
}

pub type PoolResult<T> = std::result::Result<T, PoolError>;

/// `BufferChain` failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    /// The buffer pool could not supply enough buffers. The chain is
    /// unchanged.
    #[error("buffer pool exhausted")]
    OutOfMemory,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_error_mapping() {
        assert!(matches!(PoolError::from(CoreError::Stopped), PoolError::Stopped));
        let e = PoolError::from(CoreError::Register {
            fd: 3,
            source: io::Error::from(io::ErrorKind::InvalidInput),
        });
        assert!(matches!(e, PoolError::Io(_)));
    }

    #[test]
    fn test_display() {
        let e = PoolError::InvalidChannel(ChannelId::new(7));
        assert_eq!(e.to_string(), "channel 7 not found");
        assert_eq!(
            PoolError::InvalidConfig("num_event_managers must be at least 1").to_string(),
            "invalid configuration: num_event_managers must be at least 1"
        );
    }
}
