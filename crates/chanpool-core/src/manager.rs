//! Event manager abstraction.
//!
//! An `EventManager` is a single-threaded reactor: one readiness
//! demultiplexer plus one timer queue, driven by exactly one thread. Every
//! callback registered with a manager runs on that thread, which is what
//! lets a channel mutate its own state without per-byte locking.
//!
//! # Implementors
//!
//! - `MioEventManager` (chanpool-module): `mio::Poll` + binary-heap timers.
//!
//! Registration methods may be called from any thread; the manager wakes
//! its dispatcher when a foreign thread changes its interest set.

use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::error::CoreResult;
use crate::id::TimerId;

/// Readiness callback. Invoked on the manager thread each time the
/// registered socket reports the interest it was registered for.
pub type IoCallback = Box<dyn FnMut() + Send>;

/// One-shot timer callback.
pub type TimerCallback = Box<dyn FnOnce() + Send>;

/// Arbitrary work to run on the manager thread.
pub type Job = Box<dyn FnOnce() + Send>;

/// Which readiness interest a deregistration applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Read,
    Write,
    Both,
}

impl Interest {
    #[inline]
    pub fn includes_read(self) -> bool {
        matches!(self, Interest::Read | Interest::Both)
    }

    #[inline]
    pub fn includes_write(self) -> bool {
        matches!(self, Interest::Write | Interest::Both)
    }
}

/// A single-threaded reactor.
///
/// **Contract:**
/// - Callbacks run only on the manager's dispatch thread, one at a time.
/// - Registering an interest that is already registered replaces its
///   callback.
/// - `deregister` takes effect before the next dispatch; a callback that is
///   currently running is not interrupted.
/// - `cancel_timer` is best-effort: a timer that already fired returns
///   `false`.
/// - After `stop()` returns, no callback of this manager runs again.
pub trait EventManager: Send + Sync {
    /// Position of this manager in its pool.
    fn index(&self) -> usize;

    /// Register `callback` for read readiness on `fd`.
    fn register_read(&self, fd: RawFd, callback: IoCallback) -> CoreResult<()>;

    /// Register `callback` for write readiness on `fd`.
    fn register_write(&self, fd: RawFd, callback: IoCallback) -> CoreResult<()>;

    /// Remove the given interest(s) for `fd`. Unknown descriptors are
    /// ignored.
    fn deregister(&self, fd: RawFd, interest: Interest);

    /// Schedule `callback` to run at or after `deadline`.
    fn register_timer(&self, deadline: Instant, callback: TimerCallback) -> TimerId;

    /// Cancel a pending timer. Returns `true` if it had not fired yet.
    fn cancel_timer(&self, id: TimerId) -> bool;

    /// Queue `job` to run on the manager thread after the current dispatch
    /// step. Fails with `CoreError::Stopped` once the manager is stopped.
    fn execute(&self, job: Job) -> CoreResult<()>;

    /// Wait at most `timeout` for readiness, then dispatch due timers,
    /// ready sockets and queued jobs. Returns the number of callbacks run.
    /// Must only be called by the owning thread.
    fn run_one_iteration(&self, timeout: Option<Duration>) -> CoreResult<usize>;

    /// `true` when called from the dispatch thread.
    fn is_manager_thread(&self) -> bool;

    /// Number of descriptors with at least one interest registered.
    fn num_sockets(&self) -> usize;

    /// Number of pending timers.
    fn num_timers(&self) -> usize;

    /// Stop dispatching. Jobs queued before the call still run. When called
    /// from a foreign thread this also joins the dispatch thread.
    fn stop(&self);
}
