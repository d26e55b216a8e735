//! # chanpool — asynchronous TCP channel pool
//!
//! Multiplexes many TCP connections (listening, connecting, accepted and
//! imported) over a fixed set of event manager threads. Each connection
//! is a *channel* with its own inbound and outbound [`BufferChain`],
//! back-pressure water marks and lifecycle events delivered to a client
//! [`Handler`].
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use chanpool::{ChannelPool, ListenOptions, PoolConfig};
//!
//! let pool = ChannelPool::start(PoolConfig::from_env(), Arc::new(MyHandler))?;
//! let acceptor = pool.listen("0.0.0.0:7000".parse()?, 1024, ListenOptions::default())?;
//! // ... handler callbacks run on the pool's manager threads ...
//! pool.stop();
//! ```
//!
//! ## Guarantees
//!
//! Per channel: `Up` precedes any data and `Down`; `Down` is delivered
//! exactly once and is the last callback. A connect that never succeeds
//! produces `Down` without `Up`.

pub mod config;
pub mod error;
pub mod options;
pub mod event;
pub mod stats;
pub mod buffer_chain;
pub mod registry;
pub mod channel;
pub mod clock;
pub mod pool;

mod shared;
mod connector;
mod acceptor;

#[cfg(test)]
mod testing;

pub use buffer_chain::{BufferChain, MAX_IOVECS};
pub use channel::{ChannelKind, ChannelState};
pub use clock::ClockCallback;
pub use config::{AssignmentPolicy, PoolConfig};
pub use error::{BufferError, PoolError, PoolResult};
pub use event::{
    ChannelContext, ChannelEvent, ChannelEventKind, DataEvent, DownReason, Handler, PoolEvent,
};
pub use options::{ConnectOptions, HalfOpenMode, ImportOptions, ListenOptions, ShutdownMode};
pub use pool::ChannelPool;
pub use stats::{ChannelStats, ManagerStats, PoolStats};

pub use chanpool_core::{AcceptorId, ChannelId, ClockId, Socket, SourceId};
