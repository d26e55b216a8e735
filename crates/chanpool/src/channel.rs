//! # Channel — one connection's state machine and buffers
//!
//! ```text
//!  Connecting ──(connect resolves)──► Connected ──(shutdown Graceful)──► Closing
//!       │                                 │                                  │
//!       └──────(timeout / failure)────────┴────(EOF, error, shutdown)────────┴──► Down
//! ```
//!
//! Everything except `write` runs on the channel's event manager thread:
//! readiness callbacks, timers and jobs queued with `execute`. Client
//! threads only touch the outbound side, under the outbound lock.
//!
//! Lock order is `io` then `outbound`. Neither lock is held while a
//! channel event is delivered; the inbound chain stays locked while the
//! data callback runs, so handlers must route everything except `write`
//! through the pool (which defers it to the manager).

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chanpool_core::error::is_peer_reset;
use chanpool_core::{
    ChannelId, CoreError, CoreResult, EventManager, Interest, IoCallback, Shutdown, Socket,
    SourceId, TimerId,
};
use parking_lot::Mutex;
use tracing::{debug, error, trace};

use crate::buffer_chain::BufferChain;
use crate::config::check_watermarks;
use crate::connector::ConnectState;
use crate::error::{PoolError, PoolResult};
use crate::event::{ChannelContext, ChannelEvent, ChannelEventKind, DataEvent, DownReason};
use crate::options::{ChannelOptions, HalfOpenMode, ShutdownMode};
use crate::shared::PoolShared;
use crate::stats::{ChannelCounters, ChannelStats};

/// How the channel came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Accepted by a listener.
    Accepted,
    /// Created by `connect`.
    Connected,
    /// Adopted with `import`.
    Imported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelState {
    Connecting = 0,
    Connected = 1,
    Closing = 2,
    Down = 3,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ChannelState::Connecting,
            1 => ChannelState::Connected,
            2 => ChannelState::Closing,
            _ => ChannelState::Down,
        }
    }
}

/// Manager-thread state.
pub(crate) struct IoState {
    pub socket: Option<Box<dyn Socket>>,
    pub inbound: BufferChain,
    pub read_enabled: bool,
    pub read_registered: bool,
    pub read_closed: bool,
    pub read_timer: Option<TimerId>,
    pub last_read: Instant,
    /// Graceful shutdown in progress: close once outbound is empty.
    pub close_after_drain: bool,
    /// Write half shutdown requested: shut the socket's sending side once
    /// outbound is empty.
    pub shut_write_after_drain: bool,
    /// The socket's sending side is shut down.
    pub write_shut: bool,
    pub connect: Option<ConnectState>,
}

/// Writer-side state.
pub(crate) struct Outbound {
    pub chain: BufferChain,
    pub low_watermark: usize,
    pub high_watermark: usize,
    /// Descriptor to register write interest on; set once the channel is
    /// started, cleared when it goes down.
    pub fd: Option<RawFd>,
    /// `false` once shutdown began.
    pub accepting: bool,
    pub write_registered: bool,
    /// Bytes crossed the high-water mark ...
    pub engaged: bool,
    /// ... and `BackpressureEngaged` was delivered.
    pub announced: bool,
    /// Backpressure came from an exhausted buffer pool rather than the
    /// high-water mark; released only once the chain is empty.
    pub starved: bool,
    pub max_recorded: usize,
}

impl Outbound {
    /// Engaged backpressure may be released.
    fn releasable(&self) -> bool {
        self.chain.total_bytes() <= self.low_watermark && (!self.starved || self.chain.is_empty())
    }

    fn release(&mut self) {
        self.engaged = false;
        self.announced = false;
        self.starved = false;
    }
}

pub struct Channel {
    id: ChannelId,
    kind: ChannelKind,
    source_id: SourceId,
    half_open: HalfOpenMode,
    manager: Arc<dyn EventManager>,
    shared: Arc<PoolShared>,
    state: AtomicU8,
    down: AtomicBool,
    pub(crate) io: Mutex<IoState>,
    pub(crate) outbound: Mutex<Outbound>,
    counters: ChannelCounters,
    context: Mutex<Option<ChannelContext>>,
    /// (peer, local), cached when the channel starts.
    addresses: Mutex<(Option<SocketAddr>, Option<SocketAddr>)>,
}

/// `io::ErrorKind` behind a registration failure.
pub(crate) fn core_error_kind(err: &CoreError) -> io::ErrorKind {
    match err {
        CoreError::Stopped => io::ErrorKind::Other,
        CoreError::Register { source, .. } => source.kind(),
        CoreError::Poll(source) | CoreError::Io(source) => source.kind(),
    }
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: ChannelId,
        kind: ChannelKind,
        source_id: SourceId,
        manager: Arc<dyn EventManager>,
        shared: Arc<PoolShared>,
        options: ChannelOptions,
        socket: Option<Box<dyn Socket>>,
        connect: Option<ConnectState>,
    ) -> Self {
        let state = if connect.is_some() {
            ChannelState::Connecting
        } else {
            ChannelState::Connected
        };
        let peer = connect.as_ref().map(|c| c.addr);

        Self {
            id,
            kind,
            source_id,
            half_open: options.half_open,
            io: Mutex::new(IoState {
                socket,
                inbound: BufferChain::new(shared.buffers.clone()),
                read_enabled: options.read_enabled,
                read_registered: false,
                read_closed: false,
                read_timer: None,
                last_read: Instant::now(),
                close_after_drain: false,
                shut_write_after_drain: false,
                write_shut: false,
                connect,
            }),
            outbound: Mutex::new(Outbound {
                chain: BufferChain::new(shared.buffers.clone()),
                low_watermark: shared.config.low_watermark,
                high_watermark: shared.config.high_watermark,
                fd: None,
                accepting: true,
                write_registered: false,
                engaged: false,
                announced: false,
                starved: false,
                max_recorded: 0,
            }),
            manager,
            shared,
            state: AtomicU8::new(state as u8),
            down: AtomicBool::new(false),
            counters: ChannelCounters::default(),
            context: Mutex::new(None),
            addresses: Mutex::new((peer, None)),
        }
    }

    #[inline]
    pub fn id(&self) -> ChannelId {
        self.id
    }

    #[inline]
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    #[inline]
    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    #[inline]
    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.store(state as u8, Ordering::Release);
    }

    #[inline]
    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub(crate) fn manager(&self) -> &Arc<dyn EventManager> {
        &self.manager
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }

    pub fn context(&self) -> Option<ChannelContext> {
        self.context.lock().clone()
    }

    pub(crate) fn set_context(&self, context: Option<ChannelContext>) {
        *self.context.lock() = context;
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.addresses.lock().0
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addresses.lock().1
    }

    pub fn stats(&self) -> ChannelStats {
        let out = self.outbound.lock();
        ChannelStats {
            bytes_read: self.counters.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.counters.bytes_written.load(Ordering::Relaxed),
            bytes_requested: self.counters.bytes_requested.load(Ordering::Relaxed),
            write_cache_size: out.chain.total_bytes(),
            write_cache_max: out.max_recorded,
        }
    }

    pub(crate) fn reset_write_cache_max(&self) {
        let mut out = self.outbound.lock();
        out.max_recorded = out.chain.total_bytes();
    }

    pub(crate) fn watermarks(&self) -> (usize, usize) {
        let out = self.outbound.lock();
        (out.low_watermark, out.high_watermark)
    }

    pub(crate) fn set_watermarks(self: &Arc<Self>, low: usize, high: usize) -> PoolResult<()> {
        check_watermarks(low, high)?;
        let again = {
            let mut out = self.outbound.lock();
            out.low_watermark = low;
            out.high_watermark = high;
            let again = out.engaged && out.announced && out.releasable();
            if again {
                out.release();
            }
            again
        };
        if again {
            let ch = self.clone();
            self.manager
                .execute(Box::new(move || ch.notify(ChannelEventKind::WritableAgain)))?;
        }
        Ok(())
    }

    fn event(&self, kind: ChannelEventKind) -> ChannelEvent {
        ChannelEvent {
            channel_id: self.id,
            source_id: self.source_id,
            kind,
            context: self.context(),
        }
    }

    fn read_callback(self: &Arc<Self>) -> IoCallback {
        let ch = self.clone();
        Box::new(move || ch.on_readable())
    }

    pub(crate) fn write_callback(self: &Arc<Self>) -> IoCallback {
        let ch = self.clone();
        Box::new(move || ch.on_writable())
    }

    /// Deliver a state event. Never called with `io` or `outbound` held.
    pub(crate) fn notify(self: &Arc<Self>, kind: ChannelEventKind) {
        if self.is_down() {
            return;
        }
        let event = self.event(kind);
        let handler = &self.shared.handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler.channel_state(&event))).is_err() {
            error!(channel = %self.id, ?kind, "channel event handler panicked");
            self.close(DownReason::HandlerPanic);
        }
    }

    fn register_read(self: &Arc<Self>, io: &mut IoState, fd: RawFd) -> CoreResult<()> {
        if !io.read_registered {
            self.manager.register_read(fd, self.read_callback())?;
            io.read_registered = true;
        }
        Ok(())
    }

    fn deregister_read(&self, io: &mut IoState, fd: RawFd) {
        if io.read_registered {
            self.manager.deregister(fd, Interest::Read);
            io.read_registered = false;
        }
    }

    fn cancel_read_timer(&self, io: &mut IoState) {
        if let Some(timer) = io.read_timer.take() {
            self.manager.cancel_timer(timer);
        }
    }

    fn arm_read_timer(self: &Arc<Self>, io: &mut IoState) {
        let timeout = match self.shared.config.read_timeout {
            Some(timeout) => timeout,
            None => return,
        };
        if io.read_timer.is_some() || !io.read_enabled || io.read_closed {
            return;
        }
        let ch = self.clone();
        io.read_timer = Some(
            self.manager
                .register_timer(io.last_read + timeout, Box::new(move || ch.on_read_timeout())),
        );
    }

    /// Emit `Up`, then start reading and flushing. Runs on the manager
    /// thread once per channel.
    pub(crate) fn start(self: &Arc<Self>) {
        if self.is_down() {
            return;
        }
        {
            let io = self.io.lock();
            if let Some(socket) = io.socket.as_ref() {
                let mut addresses = self.addresses.lock();
                addresses.0 = socket.peer_addr().ok().or(addresses.0);
                addresses.1 = socket.local_addr().ok();
            }
        }

        self.notify(ChannelEventKind::Up);
        if self.is_down() {
            return;
        }

        let failure = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            let fd = match io.socket.as_ref() {
                Some(socket) => socket.raw_fd(),
                None => return,
            };

            let mut failure = None;
            if io.read_enabled && !io.read_closed {
                io.last_read = Instant::now();
                if let Err(e) = self.register_read(io, fd) {
                    failure = Some(core_error_kind(&e));
                }
                self.arm_read_timer(io);
            }

            let mut out = self.outbound.lock();
            out.fd = Some(fd);
            if failure.is_none() && !out.chain.is_empty() && !out.write_registered {
                match self.manager.register_write(fd, self.write_callback()) {
                    Ok(()) => out.write_registered = true,
                    Err(e) => failure = Some(core_error_kind(&e)),
                }
            }
            failure
        };

        match failure {
            Some(kind) => self.close(DownReason::ReadError(kind)),
            None => trace!(channel = %self.id, "channel started"),
        }
    }

    /// Read readiness. At most `max_reads_per_turn` reads, then one data
    /// delivery with everything buffered.
    pub(crate) fn on_readable(self: &Arc<Self>) {
        enum After {
            Idle,
            Requeue,
            Eof,
            Failed(io::ErrorKind),
            Panicked,
        }

        let after = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if self.is_down() || !io.read_enabled || io.read_closed {
                return;
            }
            let socket = match io.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let fd = socket.raw_fd();

            let max_reads = self.shared.config.max_reads_per_turn;
            let mut after = After::Idle;
            let mut got = 0;
            let mut reads = 0;
            loop {
                if reads == max_reads {
                    after = After::Requeue;
                    break;
                }
                reads += 1;
                match io.inbound.fill_from(&mut **socket) {
                    Ok(0) => {
                        after = After::Eof;
                        break;
                    }
                    Ok(n) => got += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        after = After::Failed(e.kind());
                        break;
                    }
                }
            }

            if got > 0 {
                ChannelCounters::add(&self.counters.bytes_read, got);
                ChannelCounters::add(&self.shared.counters.bytes_read, got);
                io.last_read = Instant::now();
                if !self.deliver(&mut io.inbound) {
                    after = After::Panicked;
                }
            }

            if let After::Eof = after {
                io.read_closed = true;
                self.deregister_read(io, fd);
                self.cancel_read_timer(io);
            }
            after
        };

        match after {
            After::Idle => {}
            After::Requeue => {
                let ch = self.clone();
                if self.manager.execute(Box::new(move || ch.on_readable())).is_err() {
                    trace!(channel = %self.id, "manager stopped; read not requeued");
                }
            }
            After::Eof => match self.half_open {
                HalfOpenMode::KeepHalfOpen if self.io.lock().write_shut => {
                    self.close(DownReason::PeerClosed)
                }
                HalfOpenMode::KeepHalfOpen => {
                    debug!(channel = %self.id, "peer closed its half");
                    self.notify(ChannelEventKind::ReadClosed);
                }
                HalfOpenMode::CloseBoth => self.close(DownReason::PeerClosed),
            },
            After::Failed(kind) => {
                let reason = if is_peer_reset(&io::Error::from(kind)) {
                    DownReason::PeerClosed
                } else {
                    DownReason::ReadError(kind)
                };
                self.close(reason);
            }
            After::Panicked => self.close(DownReason::HandlerPanic),
        }
    }

    /// Hand the inbound chain to the data callback and drop what it
    /// consumed. `false` if the callback panicked.
    fn deliver(&self, inbound: &mut BufferChain) -> bool {
        let context = self.context();
        let handler = &self.shared.handler;
        let event = DataEvent {
            channel_id: self.id,
            source_id: self.source_id,
            data: inbound,
            context: context.as_ref(),
        };
        match panic::catch_unwind(AssertUnwindSafe(|| handler.data(event))) {
            Ok(consumed) => {
                inbound.consume(consumed);
                true
            }
            Err(_) => {
                error!(channel = %self.id, "data handler panicked");
                false
            }
        }
    }

    /// Write readiness: resolve a pending connect, or drain outbound.
    pub(crate) fn on_writable(self: &Arc<Self>) {
        if self.state() == ChannelState::Connecting {
            self.finish_connect();
            return;
        }

        let mut failure = None;
        let mut writable_again = false;
        let mut both_shut = false;
        let drained_close;
        {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            let socket = match io.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            let fd = socket.raw_fd();
            let mut out = self.outbound.lock();

            let mut written = 0;
            while !out.chain.is_empty() {
                match out.chain.write_to(&mut **socket) {
                    Ok(0) => break,
                    Ok(n) => written += n,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        failure = Some(e.kind());
                        break;
                    }
                }
            }
            if written > 0 {
                ChannelCounters::add(&self.counters.bytes_written, written);
                ChannelCounters::add(&self.shared.counters.bytes_written, written);
            }

            if out.chain.is_empty() && out.write_registered {
                self.manager.deregister(fd, Interest::Write);
                out.write_registered = false;
            }
            if out.engaged && out.announced && out.releasable() {
                out.release();
                writable_again = true;
            }
            drained_close = io.close_after_drain && out.chain.is_empty();

            if failure.is_none() && io.shut_write_after_drain && out.chain.is_empty() {
                io.shut_write_after_drain = false;
                match socket.shutdown(Shutdown::Write) {
                    Ok(()) => {
                        io.write_shut = true;
                        both_shut = io.read_closed;
                        debug!(channel = %self.id, "write half shut after drain");
                    }
                    Err(e) => failure = Some(e.kind()),
                }
            }
        }

        if let Some(kind) = failure {
            self.close(DownReason::WriteError(kind));
            return;
        }
        if writable_again {
            self.notify(ChannelEventKind::WritableAgain);
        }
        if drained_close || both_shut {
            self.close(DownReason::LocalShutdown);
        }
    }

    /// Queue `data` for sending. Callable from any thread.
    pub(crate) fn write(self: &Arc<Self>, data: &[u8]) -> PoolResult<()> {
        self.write_limited(data, None)
    }

    /// As `write`, additionally refused while more than `limit` bytes are
    /// buffered. That refusal is per call: no event, no backpressure.
    pub(crate) fn write_limited(self: &Arc<Self>, data: &[u8], limit: Option<usize>) -> PoolResult<()> {
        let engaged_now = {
            let mut out = self.outbound.lock();
            if !out.accepting {
                return Err(PoolError::InvalidChannel(self.id));
            }
            let total = out.chain.total_bytes();
            if out.engaged || total > out.high_watermark {
                return Err(PoolError::Backpressure(self.id));
            }
            if limit.is_some_and(|limit| total > limit) {
                return Err(PoolError::Backpressure(self.id));
            }
            if out.chain.append(data).is_err() {
                out.engaged = true;
                out.starved = true;
                drop(out);
                debug!(channel = %self.id, "buffer pool exhausted; backpressure engaged");
                let ch = self.clone();
                if self
                    .manager
                    .execute(Box::new(move || ch.announce_backpressure()))
                    .is_err()
                {
                    trace!(channel = %self.id, "manager stopped; backpressure not announced");
                }
                return Err(PoolError::Backpressure(self.id));
            }
            ChannelCounters::add(&self.counters.bytes_requested, data.len());

            let total = out.chain.total_bytes();
            out.max_recorded = out.max_recorded.max(total);
            let engaged_now = !out.engaged && total > out.high_watermark;
            if engaged_now {
                out.engaged = true;
            }

            if let Some(fd) = out.fd {
                if !out.write_registered && !out.chain.is_empty() {
                    self.manager.register_write(fd, self.write_callback())?;
                    out.write_registered = true;
                }
            }
            engaged_now
        };

        if engaged_now {
            debug!(channel = %self.id, "backpressure engaged");
            let ch = self.clone();
            self.manager
                .execute(Box::new(move || ch.announce_backpressure()))?;
        }
        Ok(())
    }

    /// Deliver `BackpressureEngaged`, and `WritableAgain` right after it if
    /// outbound already drained meanwhile.
    fn announce_backpressure(self: &Arc<Self>) {
        let again = {
            let mut out = self.outbound.lock();
            if !out.engaged || out.announced {
                return;
            }
            out.announced = true;
            let again = out.releasable();
            if again {
                out.release();
            }
            again
        };
        self.notify(ChannelEventKind::BackpressureEngaged);
        if again {
            self.notify(ChannelEventKind::WritableAgain);
        }
    }

    fn on_read_timeout(self: &Arc<Self>) {
        let fire = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            io.read_timer = None;
            if self.is_down() || !io.read_enabled || io.read_closed || io.socket.is_none() {
                return;
            }
            let timeout = match self.shared.config.read_timeout {
                Some(timeout) => timeout,
                None => return,
            };
            let now = Instant::now();
            let fire = now.duration_since(io.last_read) >= timeout;
            if fire {
                io.last_read = now;
            }
            self.arm_read_timer(io);
            fire
        };
        if fire {
            self.notify(ChannelEventKind::ReadTimeout);
        }
    }

    /// Turn auto-read on or off. Manager thread.
    pub(crate) fn set_read_enabled(self: &Arc<Self>, enable: bool) {
        let failure = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if self.is_down() || io.read_enabled == enable {
                return;
            }
            io.read_enabled = enable;

            let started = self.outbound.lock().fd.is_some();
            let fd = io.socket.as_ref().map(|socket| socket.raw_fd());
            let mut failure = None;
            if let (Some(fd), true) = (fd, started) {
                if enable {
                    if !io.read_closed {
                        if let Err(e) = self.register_read(io, fd) {
                            failure = Some(core_error_kind(&e));
                        }
                        io.last_read = Instant::now();
                        self.arm_read_timer(io);
                    }
                } else {
                    self.deregister_read(io, fd);
                    self.cancel_read_timer(io);
                }
            }
            failure
        };

        if let Some(kind) = failure {
            self.close(DownReason::ReadError(kind));
            return;
        }
        self.notify(if enable {
            ChannelEventKind::ReadEnabled
        } else {
            ChannelEventKind::ReadDisabled
        });
        if enable {
            self.redeliver();
        }
    }

    /// Present bytes an earlier delivery left unconsumed, without waiting
    /// for new ones.
    fn redeliver(self: &Arc<Self>) {
        let delivered = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if self.is_down() || !io.read_enabled || io.inbound.is_empty() {
                return;
            }
            self.deliver(&mut io.inbound)
        };
        if !delivered {
            self.close(DownReason::HandlerPanic);
        }
    }

    /// Client-requested shutdown. Manager thread; for `Graceful` and
    /// `Immediate` the registry entry is already gone.
    pub(crate) fn shutdown(self: &Arc<Self>, mode: ShutdownMode) {
        if self.is_down() {
            return;
        }
        match mode {
            ShutdownMode::Immediate => return self.close(DownReason::LocalShutdown),
            ShutdownMode::Read => return self.shutdown_read(),
            ShutdownMode::Write => return self.shutdown_write(),
            ShutdownMode::Graceful => {}
        }

        let drained = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if let Some(fd) = io.socket.as_ref().map(|socket| socket.raw_fd()) {
                self.deregister_read(io, fd);
            }
            self.cancel_read_timer(io);

            let mut out = self.outbound.lock();
            out.accepting = false;
            let drained = out.chain.is_empty() || out.fd.is_none();
            if !drained {
                io.close_after_drain = true;
                self.set_state(ChannelState::Closing);
            }
            drained
        };

        if drained {
            self.close(DownReason::LocalShutdown);
        } else {
            debug!(channel = %self.id, "graceful shutdown: draining outbound");
        }
    }

    /// Stop reading and shut the socket's receiving side. Down once the
    /// write half is shut too.
    fn shutdown_read(self: &Arc<Self>) {
        let (failure, both_shut) = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if io.read_closed {
                return;
            }
            let fd = match io.socket.as_ref() {
                Some(socket) => socket.raw_fd(),
                None => return,
            };
            self.deregister_read(io, fd);
            self.cancel_read_timer(io);
            io.read_closed = true;
            let failure = io
                .socket
                .as_mut()
                .and_then(|socket| socket.shutdown(Shutdown::Read).err());
            (failure, io.write_shut)
        };

        if let Some(e) = failure {
            return self.close(DownReason::ReadError(e.kind()));
        }
        debug!(channel = %self.id, "read half shut");
        if both_shut {
            return self.close(DownReason::LocalShutdown);
        }
        self.notify(ChannelEventKind::ReadClosed);
    }

    /// Refuse further writes and shut the socket's sending side once what
    /// is buffered has been sent. Down once the read half is closed too.
    fn shutdown_write(self: &Arc<Self>) {
        let (failure, both_shut) = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            if io.write_shut || io.shut_write_after_drain {
                return;
            }
            let mut out = self.outbound.lock();
            out.accepting = false;
            let socket = match io.socket.as_mut() {
                Some(socket) => socket,
                None => return,
            };
            if !out.chain.is_empty() && out.fd.is_some() {
                io.shut_write_after_drain = true;
                debug!(channel = %self.id, "write half: draining outbound");
                return;
            }
            match socket.shutdown(Shutdown::Write) {
                Ok(()) => {
                    io.write_shut = true;
                    (None, io.read_closed)
                }
                Err(e) => (Some(e.kind()), false),
            }
        };

        if let Some(kind) = failure {
            return self.close(DownReason::WriteError(kind));
        }
        debug!(channel = %self.id, "write half shut");
        if both_shut {
            self.close(DownReason::LocalShutdown);
        }
    }

    /// Take the channel down and deliver `Down`. Idempotent; only the first
    /// call has any effect.
    pub(crate) fn close(self: &Arc<Self>, reason: DownReason) {
        self.teardown(Some(reason));
    }

    /// Take the channel down without delivering `Down`. Used when its
    /// manager no longer runs.
    pub(crate) fn close_quietly(self: &Arc<Self>) {
        self.teardown(None);
    }

    fn teardown(self: &Arc<Self>, reason: Option<DownReason>) {
        if self.down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.registry.remove(self.id);
        self.shared.closing.lock().remove(&self.id);

        let (socket, discarded) = {
            let mut guard = self.io.lock();
            let io = &mut *guard;
            let discarded = {
                let mut out = self.outbound.lock();
                self.set_state(ChannelState::Down);
                out.accepting = false;
                out.fd = None;
                out.write_registered = false;
                out.release();
                let discarded = out.chain.total_bytes();
                out.chain.clear();
                discarded
            };
            io.inbound.clear();
            io.read_registered = false;
            self.cancel_read_timer(io);
            if let Some(mut connect) = io.connect.take() {
                connect.cancel_timers(&*self.manager);
            }
            (io.socket.take(), discarded)
        };

        if let Some(socket) = socket {
            self.manager.deregister(socket.raw_fd(), Interest::Both);
            drop(socket);
        }
        self.shared.channel_closed(self.manager.index());
        debug!(channel = %self.id, ?reason, discarded, "channel down");

        if let Some(reason) = reason {
            let event = self.event(ChannelEventKind::Down { reason, discarded });
            let handler = &self.shared.handler;
            if panic::catch_unwind(AssertUnwindSafe(|| handler.channel_state(&event))).is_err() {
                error!(channel = %self.id, "down handler panicked");
            }
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .field("source_id", &self.source_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pump, pump_until, Recorded, RecordingHandler, Rig};
    use std::io::{Read, Write};
    use std::time::Duration;

    #[test]
    fn test_up_then_data_then_down() {
        let rig = Rig::new(|c| c);
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        peer.write_all(b"hello").unwrap();
        pump_until(&rig.manager, || rig.handler.data_bytes(ch.id()) == 5);
        drop(peer);
        pump_until(&rig.manager, || ch.is_down());

        let events = rig.handler.kinds(ch.id());
        assert_eq!(events.first(), Some(&ChannelEventKind::Up));
        assert_eq!(
            events.last(),
            Some(&ChannelEventKind::Down {
                reason: DownReason::PeerClosed,
                discarded: 0
            })
        );
        assert_eq!(rig.handler.downs(ch.id()), 1);
        assert_eq!(ch.stats().bytes_read, 5);
        assert!(rig.shared.registry.find(ch.id()).is_none());
    }

    #[test]
    fn test_partial_consume_keeps_remainder() {
        let rig = Rig::with_handler(|c| c, RecordingHandler::consuming_at_most(2));
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        peer.write_all(b"abcde").unwrap();
        pump_until(&rig.manager, || !rig.handler.data_of(ch.id()).is_empty());
        // The unconsumed tail is presented again with the next bytes.
        assert_eq!(rig.handler.data_of(ch.id())[0], b"abcde");
        peer.write_all(b"f").unwrap();
        pump_until(&rig.manager, || rig.handler.data_of(ch.id()).len() == 2);
        assert_eq!(rig.handler.data_of(ch.id())[1], b"cdef");
        assert_eq!(ch.io.lock().inbound.total_bytes(), 2);
    }

    #[test]
    fn test_backpressure_engage_refuse_and_release() {
        let rig = Rig::new(|c| c.watermarks(100, 1_000));
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        // Nothing is flushed until the manager runs.
        ch.write(&[1u8; 600]).unwrap();
        ch.write(&[2u8; 600]).unwrap();
        assert!(matches!(ch.write(b"x"), Err(PoolError::Backpressure(_))));
        assert_eq!(ch.stats().bytes_requested, 1_200);
        assert_eq!(ch.stats().write_cache_max, 1_200);

        let mut sink = vec![0u8; 4096];
        let mut received = 0;
        pump_until(&rig.manager, || {
            while let Ok(n) = peer.read(&mut sink) {
                if n == 0 {
                    break;
                }
                received += n;
            }
            rig.handler.count(ch.id(), ChannelEventKind::WritableAgain) == 1
        });

        let events = rig.handler.kinds(ch.id());
        let engaged = events.iter().position(|k| *k == ChannelEventKind::BackpressureEngaged);
        let again = events.iter().position(|k| *k == ChannelEventKind::WritableAgain);
        assert!(engaged.is_some() && engaged < again);
        assert_eq!(rig.handler.count(ch.id(), ChannelEventKind::BackpressureEngaged), 1);

        ch.write(b"more").unwrap();
        pump_until(&rig.manager, || ch.stats().write_cache_size == 0);
        assert_eq!(ch.stats().bytes_written, 1_204);
        assert!(received <= 1_204);
    }

    #[test]
    fn test_refused_between_watermarks_while_engaged() {
        let rig = Rig::new(|c| c.watermarks(100, 1_000));
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        ch.write(&[1u8; 600]).unwrap();
        ch.write(&[2u8; 600]).unwrap();
        assert!(matches!(ch.write(b"x"), Err(PoolError::Backpressure(_))));

        // Between the marks: still engaged, still refused.
        ch.outbound.lock().chain.consume(500);
        assert_eq!(ch.stats().write_cache_size, 700);
        assert!(matches!(ch.write(b"x"), Err(PoolError::Backpressure(_))));

        let mut sink = vec![0u8; 4096];
        pump_until(&rig.manager, || {
            while let Ok(n) = peer.read(&mut sink) {
                if n == 0 {
                    break;
                }
            }
            rig.handler.count(ch.id(), ChannelEventKind::WritableAgain) == 1
        });
        ch.write(b"x").unwrap();
    }

    #[test]
    fn test_buffer_exhaustion_engages_and_releases() {
        let rig = Rig::new(|c| c.buffers(16, Some(4)));
        let (ch, _peer) = rig.import();
        pump(&rig.manager, 1);

        ch.write(&[7u8; 64]).unwrap();
        assert!(matches!(ch.write(b"x"), Err(PoolError::Backpressure(_))));
        assert!(matches!(ch.write(b"y"), Err(PoolError::Backpressure(_))));
        assert_eq!(ch.stats().bytes_requested, 64);

        pump_until(&rig.manager, || {
            rig.handler.count(ch.id(), ChannelEventKind::WritableAgain) == 1
        });
        let events = rig.handler.kinds(ch.id());
        let engaged = events.iter().position(|k| *k == ChannelEventKind::BackpressureEngaged);
        let again = events.iter().position(|k| *k == ChannelEventKind::WritableAgain);
        assert!(engaged.is_some() && engaged < again);
        assert_eq!(ch.stats().write_cache_size, 0);

        ch.write(b"x").unwrap();
        assert!(!ch.outbound.lock().engaged);
    }

    #[test]
    fn test_enqueue_watermark_refuses_without_events() {
        let rig = Rig::new(|c| c);
        let (ch, _peer) = rig.import();
        // Not started: the 100 bytes stay buffered.
        ch.write(&[0u8; 100]).unwrap();

        assert!(matches!(
            ch.write_limited(b"x", Some(50)),
            Err(PoolError::Backpressure(_))
        ));
        assert!(!ch.outbound.lock().engaged);
        ch.write_limited(b"x", Some(200)).unwrap();
        assert_eq!(ch.stats().write_cache_size, 101);

        pump(&rig.manager, 3);
        assert_eq!(rig.handler.count(ch.id(), ChannelEventKind::BackpressureEngaged), 0);
    }

    #[test]
    fn test_write_half_then_read_half() {
        let rig = Rig::new(|c| c);
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        ch.write(b"abc").unwrap();
        ch.shutdown(ShutdownMode::Write);
        assert!(matches!(ch.write(b"x"), Err(PoolError::InvalidChannel(_))));
        pump_until(&rig.manager, || ch.io.lock().write_shut);

        let mut got = Vec::new();
        peer.set_nonblocking(false).unwrap();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"abc");
        assert!(!ch.is_down());

        peer.write_all(b"back").unwrap();
        pump_until(&rig.manager, || rig.handler.data_bytes(ch.id()) == 4);

        ch.shutdown(ShutdownMode::Read);
        assert!(ch.is_down());
        assert_eq!(
            rig.handler.kinds(ch.id()).last(),
            Some(&ChannelEventKind::Down {
                reason: DownReason::LocalShutdown,
                discarded: 0
            })
        );
    }

    #[test]
    fn test_read_half_keeps_writing() {
        let rig = Rig::new(|c| c);
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        ch.shutdown(ShutdownMode::Read);
        assert_eq!(rig.handler.count(ch.id(), ChannelEventKind::ReadClosed), 1);
        assert!(!ch.io.lock().read_registered);

        ch.write(b"out").unwrap();
        pump_until(&rig.manager, || ch.stats().bytes_written == 3);
        let mut buf = [0u8; 8];
        peer.set_nonblocking(false).unwrap();
        assert_eq!(peer.read(&mut buf).unwrap(), 3);
        assert!(!ch.is_down());
    }

    #[test]
    fn test_graceful_shutdown_drains_first() {
        let rig = Rig::new(|c| c);
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        ch.write(b"bye").unwrap();
        rig.shared.registry.remove(ch.id());
        ch.shutdown(ShutdownMode::Graceful);
        pump_until(&rig.manager, || ch.is_down());

        let mut got = Vec::new();
        peer.set_nonblocking(false).unwrap();
        peer.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"bye");
        assert_eq!(
            rig.handler.kinds(ch.id()).last(),
            Some(&ChannelEventKind::Down {
                reason: DownReason::LocalShutdown,
                discarded: 0
            })
        );
    }

    #[test]
    fn test_immediate_shutdown_reports_discarded() {
        let rig = Rig::new(|c| c);
        let (ch, _peer) = rig.import();
        // Not started yet: nothing can be flushed.
        ch.write(b"0123456789").unwrap();
        ch.shutdown(ShutdownMode::Immediate);

        assert!(ch.is_down());
        assert_eq!(rig.handler.downs(ch.id()), 1);
        assert!(rig.handler.recorded().iter().any(|r| matches!(
            r,
            Recorded::State(_, ChannelEventKind::Down { discarded: 10, .. })
        )));
        assert!(matches!(ch.write(b"x"), Err(PoolError::InvalidChannel(_))));
    }

    #[test]
    fn test_close_is_idempotent() {
        let rig = Rig::new(|c| c);
        let (ch, _peer) = rig.import();
        pump(&rig.manager, 1);
        ch.close(DownReason::LocalShutdown);
        ch.close(DownReason::PeerClosed);
        assert_eq!(rig.handler.downs(ch.id()), 1);
        assert_eq!(rig.manager.num_sockets(), 0);
        assert_eq!(rig.shared.load[0].load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_half_open_keeps_writing() {
        let rig = Rig::new(|c| c);
        let (ch, peer) = rig.import_with(ChannelOptions {
            read_enabled: true,
            half_open: HalfOpenMode::KeepHalfOpen,
        });
        pump(&rig.manager, 1);

        peer.shutdown(std::net::Shutdown::Write).unwrap();
        pump_until(&rig.manager, || {
            rig.handler.count(ch.id(), ChannelEventKind::ReadClosed) == 1
        });
        assert!(!ch.is_down());

        ch.write(b"still here").unwrap();
        pump_until(&rig.manager, || ch.stats().bytes_written == 10);
        let mut peer = peer;
        let mut buf = [0u8; 16];
        peer.set_nonblocking(false).unwrap();
        assert_eq!(peer.read(&mut buf).unwrap(), 10);
    }

    #[test]
    fn test_disable_enable_read() {
        let rig = Rig::new(|c| c);
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        ch.set_read_enabled(false);
        peer.write_all(b"queued").unwrap();
        pump(&rig.manager, 3);
        assert_eq!(rig.handler.data_bytes(ch.id()), 0);

        ch.set_read_enabled(true);
        pump_until(&rig.manager, || rig.handler.data_bytes(ch.id()) == 6);
        let kinds = rig.handler.kinds(ch.id());
        assert!(kinds.contains(&ChannelEventKind::ReadDisabled));
        assert!(kinds.contains(&ChannelEventKind::ReadEnabled));

        // No event when nothing changes.
        ch.set_read_enabled(true);
        assert_eq!(rig.handler.count(ch.id(), ChannelEventKind::ReadEnabled), 1);
    }

    #[test]
    fn test_enable_read_redelivers_unconsumed() {
        let rig = Rig::with_handler(|c| c, RecordingHandler::consuming_at_most(0));
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        peer.write_all(b"keep").unwrap();
        pump_until(&rig.manager, || rig.handler.data_of(ch.id()).len() == 1);
        ch.set_read_enabled(false);
        ch.set_read_enabled(true);

        let data = rig.handler.data_of(ch.id());
        assert_eq!(data.len(), 2);
        assert_eq!(data[1], b"keep");
    }

    #[test]
    fn test_read_timeout_fires_and_stays_up() {
        let rig = Rig::new(|c| c.read_timeout(Some(Duration::from_millis(30))));
        let (ch, _peer) = rig.import();
        pump(&rig.manager, 1);

        pump_until(&rig.manager, || {
            rig.handler.count(ch.id(), ChannelEventKind::ReadTimeout) >= 2
        });
        assert!(!ch.is_down());
    }

    #[test]
    fn test_handler_panic_closes_channel() {
        let rig = Rig::with_handler(|c| c, RecordingHandler::panicking_on_data());
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        peer.write_all(b"boom").unwrap();
        pump_until(&rig.manager, || ch.is_down());
        assert!(rig.handler.recorded().iter().any(|r| matches!(
            r,
            Recorded::State(_, ChannelEventKind::Down { reason: DownReason::HandlerPanic, .. })
        )));
    }

    #[test]
    fn test_read_cap_requeues() {
        let rig = Rig::new(|c| c.max_reads_per_turn(1).buffers(4, None));
        let (ch, mut peer) = rig.import();
        pump(&rig.manager, 1);

        peer.write_all(b"0123456789ab").unwrap();
        pump_until(&rig.manager, || rig.handler.data_bytes(ch.id()) == 12);
        assert!(rig.handler.data_of(ch.id()).len() >= 3);
    }

    #[test]
    fn test_set_watermarks_validates() {
        let rig = Rig::new(|c| c);
        let (ch, _peer) = rig.import();
        assert!(ch.set_watermarks(10, 10).is_err());
        ch.set_watermarks(10, 20).unwrap();
        assert_eq!(ch.watermarks(), (10, 20));
    }
}
