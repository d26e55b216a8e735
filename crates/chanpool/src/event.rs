//! Events delivered to the client [`Handler`].
//!
//! Per channel, callbacks arrive on the channel's event manager thread in
//! order: `Up` first, then any mix of data and state events, then exactly
//! one `Down`. A connect that never succeeds produces `Down` without `Up`.

use std::any::Any;
use std::io;
use std::sync::Arc;

use chanpool_core::{AcceptorId, ChannelId, SourceId};

use crate::buffer_chain::BufferChain;

/// Opaque per-channel value set with `ChannelPool::set_channel_context`.
pub type ChannelContext = Arc<dyn Any + Send + Sync>;

/// Why a channel went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    /// Peer closed the connection.
    PeerClosed,
    ReadError(io::ErrorKind),
    WriteError(io::ErrorKind),
    /// The connect deadline passed before any attempt succeeded.
    ConnectTimeout,
    /// `max_attempts` connect attempts failed; carries the last error.
    ConnectFailed(io::ErrorKind),
    /// `ChannelPool::shutdown`.
    LocalShutdown,
    /// `ChannelPool::stop`.
    PoolStopped,
    /// A handler callback panicked.
    HandlerPanic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventKind {
    Up,
    /// Last event of the channel. `discarded` counts outbound bytes that
    /// were never sent.
    Down { reason: DownReason, discarded: usize },
    /// Outbound bytes drained to the low-water mark after backpressure.
    WritableAgain,
    /// A write pushed outbound bytes above the high-water mark, or the
    /// buffer pool ran out.
    BackpressureEngaged,
    ReadEnabled,
    ReadDisabled,
    /// No inbound bytes for `PoolConfig::read_timeout`.
    ReadTimeout,
    /// Peer EOF on a `KeepHalfOpen` channel.
    ReadClosed,
}

#[derive(Clone)]
pub struct ChannelEvent {
    pub channel_id: ChannelId,
    pub source_id: SourceId,
    pub kind: ChannelEventKind,
    pub context: Option<ChannelContext>,
}

impl std::fmt::Debug for ChannelEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEvent")
            .field("channel_id", &self.channel_id)
            .field("source_id", &self.source_id)
            .field("kind", &self.kind)
            .field("context", &self.context.is_some())
            .finish()
    }
}

/// Inbound bytes for one channel. The handler returns how many bytes
/// (from the front of `data`) it consumed; the rest stays buffered and is
/// presented again, followed by new bytes, on the next delivery.
pub struct DataEvent<'a> {
    pub channel_id: ChannelId,
    pub source_id: SourceId,
    pub data: &'a BufferChain,
    pub context: Option<&'a ChannelContext>,
}

/// Pool-level conditions not tied to a live channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    /// `accept` failed; the listener is re-armed after a back-off.
    AcceptError { acceptor: AcceptorId, kind: io::ErrorKind },
    /// No connection for the listener's `accept_timeout`.
    AcceptTimeout { acceptor: AcceptorId },
    /// A connection was refused because `max_connections` was reached.
    ChannelLimit { source_id: SourceId },
    /// One connect attempt failed; more may follow.
    ConnectAttemptFailed {
        channel_id: ChannelId,
        source_id: SourceId,
        attempt: u32,
        kind: io::ErrorKind,
    },
}

/// Client callbacks. All of them run on event manager threads and must
/// not block. A panic closes the affected channel with
/// `DownReason::HandlerPanic`.
pub trait Handler: Send + Sync + 'static {
    fn channel_state(&self, event: &ChannelEvent);

    /// Returns the number of bytes consumed from `event.data`.
    fn data(&self, event: DataEvent<'_>) -> usize;

    fn pool_state(&self, event: &PoolEvent) {
        let _ = event;
    }
}
