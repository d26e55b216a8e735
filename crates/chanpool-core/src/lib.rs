//! # chanpool-core — capability traits for the channel pool
//!
//! This crate defines the boundaries the channel pool is written against.
//! Each trait models one capability the pool consumes but does not
//! implement itself:
//!
//! - [`Socket`](socket::Socket) — a non-blocking byte stream
//! - [`EventManager`](manager::EventManager) — a single-threaded reactor
//!   (readiness demultiplexer + timer queue)
//! - [`BufferPool`](buffer::BufferPool) — fixed-size buffer supply
//!
//! Default implementations live in `chanpool-module`. The pool itself
//! (`chanpool`) depends only on the traits, so tests can drive a channel
//! over a scripted socket from the test thread.

pub mod id;
pub mod socket;
pub mod manager;
pub mod buffer;
pub mod error;
pub mod env;

pub use id::{AcceptorId, ChannelId, ClockId, SourceId, TimerId};
pub use socket::{Listener, Shutdown, Socket, SocketFactory, SocketOptions};
pub use manager::{EventManager, Interest, IoCallback, Job, TimerCallback};
pub use buffer::{Buffer, BufferPool};
pub use error::{CoreError, CoreResult};
