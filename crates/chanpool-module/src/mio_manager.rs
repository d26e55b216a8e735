//! # MioEventManager — readiness reactor on `mio::Poll`
//!
//! One manager owns one `Poll`, one `TimerQueue` and one job queue, and is
//! driven by exactly one thread (spawned by [`MioEventManager::spawn`], or
//! the test thread calling `run_one_iteration` by hand).
//!
//! ```text
//!  foreign threads                     manager thread
//!  ───────────────                     ──────────────
//!  register_read/write ──► Registry    poll(timeout = min(next timer, caller))
//!  register_timer ───────► TimerQueue    │
//!  execute ──────────────► SegQueue      ├─► due timers
//!                 └──────► Waker         ├─► ready sockets (read, then write)
//!                                        └─► jobs queued before this step
//! ```
//!
//! Descriptors are registered through `SourceFd`, so anything with a raw
//! fd can be watched. `mio` is edge-triggered: a callback is expected to
//! drain its socket until `WouldBlock`, or re-queue itself with `execute`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use chanpool_core::{CoreError, CoreResult, EventManager, Interest, IoCallback, Job, TimerCallback, TimerId};
use crossbeam_queue::SegQueue;
use mio::unix::SourceFd;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::timer_queue::TimerQueue;

/// Default `mio::Events` capacity per poll.
pub const DEFAULT_EVENTS_CAPACITY: usize = 1024;

const WAKER_TOKEN: Token = Token(usize::MAX);

/// A registered interest. `callback` is `None` while the callback is
/// running; `generation` tells the dispatcher whether the slot was replaced
/// in the meantime.
struct Slot {
    generation: u64,
    callback: Option<IoCallback>,
}

struct Source {
    token: Token,
    read: Option<Slot>,
    write: Option<Slot>,
}

impl Source {
    fn interest(&self) -> Option<mio::Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }

    fn slot_mut(&mut self, dir: Direction) -> &mut Option<Slot> {
        match dir {
            Direction::Read => &mut self.read,
            Direction::Write => &mut self.write,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

#[derive(Default)]
struct SourceTable {
    by_fd: HashMap<RawFd, Source>,
    by_token: HashMap<Token, RawFd>,
    next_token: usize,
    next_generation: u64,
}

struct Poller {
    poll: Poll,
    events: Events,
}

/// `EventManager` backed by `mio::Poll`.
pub struct MioEventManager {
    index: usize,
    poller: Mutex<Poller>,
    registry: Registry,
    waker: Waker,
    sources: Mutex<SourceTable>,
    timers: TimerQueue,
    jobs: SegQueue<Job>,
    stopped: AtomicBool,
    thread_id: OnceLock<ThreadId>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl MioEventManager {
    /// Create a manager without a dispatch thread. The first thread to call
    /// `run_one_iteration` becomes its manager thread.
    pub fn new(index: usize, events_capacity: usize) -> CoreResult<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;

        Ok(Self {
            index,
            poller: Mutex::new(Poller {
                poll,
                events: Events::with_capacity(events_capacity.max(16)),
            }),
            registry,
            waker,
            sources: Mutex::new(SourceTable::default()),
            timers: TimerQueue::new(),
            jobs: SegQueue::new(),
            stopped: AtomicBool::new(false),
            thread_id: OnceLock::new(),
            handle: Mutex::new(None),
        })
    }

    /// Create a manager and start its dispatch thread (`chanpool-em-{index}`).
    pub fn spawn(index: usize, events_capacity: usize) -> CoreResult<Arc<Self>> {
        let manager = Arc::new(Self::new(index, events_capacity)?);
        let runner = manager.clone();

        let handle = thread::Builder::new()
            .name(format!("chanpool-em-{}", index))
            .spawn(move || runner.run())?;
        *manager.handle.lock() = Some(handle);

        Ok(manager)
    }

    /// Dispatch until `stop()`. Runs jobs still queued at that point, then
    /// drops every registration and timer.
    pub fn run(&self) {
        let _ = self.thread_id.set(thread::current().id());
        debug!(manager = self.index, "event manager started");

        while !self.stopped.load(Ordering::Acquire) {
            if let Err(e) = self.run_one_iteration(None) {
                error!(manager = self.index, error = %e, "event manager poll failed");
                self.stopped.store(true, Ordering::Release);
                break;
            }
        }

        let drained = self.run_jobs(usize::MAX);
        self.clear_sources();
        self.timers.clear();
        debug!(manager = self.index, drained, "event manager stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            warn!(manager = self.index, error = %e, "event manager wake failed");
        }
    }

    fn wake_if_foreign(&self) {
        if !self.is_manager_thread() {
            self.wake();
        }
    }

    fn register(&self, fd: RawFd, dir: Direction, callback: IoCallback) -> CoreResult<()> {
        let mut guard = self.sources.lock();
        let table = &mut *guard;
        let generation = table.next_generation;
        table.next_generation += 1;

        let mut created = false;
        let next_token = &mut table.next_token;
        let by_token = &mut table.by_token;
        let source = table.by_fd.entry(fd).or_insert_with(|| {
            created = true;
            let token = Token(*next_token);
            *next_token = (*next_token + 1) % WAKER_TOKEN.0;
            by_token.insert(token, fd);
            Source { token, read: None, write: None }
        });
        let before = source.interest();
        let previous = source.slot_mut(dir).replace(Slot {
            generation,
            callback: Some(callback),
        });
        let after = source.interest();
        let token = source.token;

        let result = match (before, after) {
            (None, Some(interest)) => self.registry.register(&mut SourceFd(&fd), token, interest),
            (Some(old), Some(new)) if old != new => {
                match self.registry.reregister(&mut SourceFd(&fd), token, new) {
                    // The descriptor was closed and reused without a
                    // deregister; epoll already forgot it.
                    Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                        self.registry.register(&mut SourceFd(&fd), token, new)
                    }
                    other => other,
                }
            }
            _ => Ok(()),
        };

        if let Err(source_err) = result {
            *source.slot_mut(dir) = previous;
            if created {
                table.by_fd.remove(&fd);
                table.by_token.remove(&token);
            }
            return Err(CoreError::Register { fd, source: source_err });
        }

        trace!(manager = self.index, fd, ?dir, token = token.0, "registered");
        Ok(())
    }

    /// Take the callback for `(token, dir)`, run it without holding the
    /// table lock, and put it back unless it was replaced or removed while
    /// running.
    fn fire(&self, token: Token, dir: Direction) -> bool {
        let (fd, generation, mut callback) = {
            let mut table = self.sources.lock();
            let fd = match table.by_token.get(&token) {
                Some(fd) => *fd,
                None => return false,
            };
            let slot = match table.by_fd.get_mut(&fd).and_then(|s| s.slot_mut(dir).as_mut()) {
                Some(slot) => slot,
                None => return false,
            };
            match slot.callback.take() {
                Some(cb) => (fd, slot.generation, cb),
                None => return false,
            }
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback()));
        if outcome.is_err() {
            error!(manager = self.index, fd, ?dir, "readiness callback panicked");
        }

        let mut table = self.sources.lock();
        if let Some(source) = table.by_fd.get_mut(&fd) {
            if source.token == token {
                if let Some(slot) = source.slot_mut(dir).as_mut() {
                    if slot.generation == generation && slot.callback.is_none() {
                        slot.callback = Some(callback);
                    }
                }
            }
        }
        true
    }

    fn run_guarded(&self, what: &'static str, f: Box<dyn FnOnce() + Send>) {
        if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(manager = self.index, what, "callback panicked");
        }
    }

    /// Run at most `limit` queued jobs.
    fn run_jobs(&self, limit: usize) -> usize {
        let mut ran = 0;
        while ran < limit {
            match self.jobs.pop() {
                Some(job) => {
                    self.run_guarded("job", job);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    fn clear_sources(&self) {
        let removed: Vec<Source> = {
            let mut table = self.sources.lock();
            table.by_token.clear();
            table
                .by_fd
                .drain()
                .map(|(fd, source)| {
                    let _ = self.registry.deregister(&mut SourceFd(&fd));
                    source
                })
                .collect()
        };
        drop(removed);
    }

    fn poll_timeout(&self, timeout: Option<Duration>) -> Option<Duration> {
        if !self.jobs.is_empty() {
            return Some(Duration::ZERO);
        }
        match self.timers.next_deadline() {
            Some(deadline) => {
                let until = deadline.saturating_duration_since(Instant::now());
                Some(timeout.map_or(until, |t| t.min(until)))
            }
            None => timeout,
        }
    }
}

impl EventManager for MioEventManager {
    fn index(&self) -> usize {
        self.index
    }

    fn register_read(&self, fd: RawFd, callback: IoCallback) -> CoreResult<()> {
        self.register(fd, Direction::Read, callback)
    }

    fn register_write(&self, fd: RawFd, callback: IoCallback) -> CoreResult<()> {
        self.register(fd, Direction::Write, callback)
    }

    fn deregister(&self, fd: RawFd, interest: Interest) {
        let mut removed: Vec<Slot> = Vec::with_capacity(2);
        {
            let mut table = self.sources.lock();
            let source = match table.by_fd.get_mut(&fd) {
                Some(source) => source,
                None => return,
            };
            if interest.includes_read() {
                removed.extend(source.read.take());
            }
            if interest.includes_write() {
                removed.extend(source.write.take());
            }
            let token = source.token;

            match source.interest() {
                Some(remaining) => {
                    if let Err(e) = self.registry.reregister(&mut SourceFd(&fd), token, remaining) {
                        debug!(manager = self.index, fd, error = %e, "reregister after deregister failed");
                    }
                }
                None => {
                    // Fails harmlessly when the fd is already closed.
                    let _ = self.registry.deregister(&mut SourceFd(&fd));
                    table.by_fd.remove(&fd);
                    table.by_token.remove(&token);
                }
            }
        }
        trace!(manager = self.index, fd, ?interest, "deregistered");
        drop(removed);
    }

    fn register_timer(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = self.timers.insert(deadline, callback);
        self.wake_if_foreign();
        id
    }

    fn cancel_timer(&self, id: TimerId) -> bool {
        self.timers.cancel(id)
    }

    fn execute(&self, job: Job) -> CoreResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(CoreError::Stopped);
        }
        self.jobs.push(job);
        self.wake_if_foreign();
        Ok(())
    }

    fn run_one_iteration(&self, timeout: Option<Duration>) -> CoreResult<usize> {
        let _ = self.thread_id.get_or_init(|| thread::current().id());
        let pending_jobs = self.jobs.len();

        let ready: Vec<(Token, bool, bool)> = {
            let mut guard = self.poller.lock();
            let poller = &mut *guard;
            let timeout = self.poll_timeout(timeout);
            match poller.poll.poll(&mut poller.events, timeout) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CoreError::Poll(e)),
            }
            poller
                .events
                .iter()
                .filter(|ev| ev.token() != WAKER_TOKEN)
                .map(|ev| {
                    let read = ev.is_readable() || ev.is_read_closed() || ev.is_error();
                    let write = ev.is_writable() || ev.is_write_closed() || ev.is_error();
                    (ev.token(), read, write)
                })
                .collect()
        };

        let mut ran = 0;

        for callback in self.timers.pop_expired(Instant::now()) {
            self.run_guarded("timer", callback);
            ran += 1;
        }

        for (token, read, write) in ready {
            if read && self.fire(token, Direction::Read) {
                ran += 1;
            }
            if write && self.fire(token, Direction::Write) {
                ran += 1;
            }
        }

        // Jobs queued by the callbacks above wait for the next step.
        ran += self.run_jobs(pending_jobs);
        Ok(ran)
    }

    fn is_manager_thread(&self) -> bool {
        self.thread_id.get() == Some(&thread::current().id())
    }

    fn num_sockets(&self) -> usize {
        self.sources.lock().by_fd.len()
    }

    fn num_timers(&self) -> usize {
        self.timers.len()
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            debug!(manager = self.index, "stopping event manager");
        }
        self.wake();
        if !self.is_manager_thread() {
            if let Some(handle) = self.handle.lock().take() {
                if handle.join().is_err() {
                    error!(manager = self.index, "event manager thread panicked");
                }
            }
        }
    }
}
