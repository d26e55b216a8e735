//! # ChannelPool — the public entry point
//!
//! ```text
//!  client threads                        event manager threads
//!  ──────────────                        ─────────────────────
//!  listen / connect / import ──► registry ──► chanpool-em-0 ─┐
//!  write ──────────────► outbound chain       chanpool-em-1  ├─► Handler
//!  shutdown ────────► registry.remove         ...            │
//!                          └── job ──────────► chanpool-em-N ┘
//! ```
//!
//! Every channel lives on exactly one manager for its whole life. All
//! handler callbacks for it run on that manager's thread.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chanpool_core::{
    AcceptorId, BufferPool, ChannelId, ClockId, EventManager, Socket, SocketFactory,
};
use chanpool_module::{FixedBufferPool, HeapBufferPool, MioEventManager, TcpSocket, TcpSocketFactory};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::acceptor::Acceptor;
use crate::channel::{Channel, ChannelKind};
use crate::clock::{ClockCallback, Clocks};
use crate::config::PoolConfig;
use crate::connector::ConnectState;
use crate::error::{PoolError, PoolResult};
use crate::event::{ChannelContext, DownReason, Handler};
use crate::options::{ConnectOptions, ImportOptions, ListenOptions, ShutdownMode};
use crate::shared::PoolShared;
use crate::stats::{ChannelStats, ManagerStats, PoolStats};

pub struct ChannelPool {
    shared: Arc<PoolShared>,
    acceptors: Mutex<HashMap<AcceptorId, Arc<Acceptor>>>,
    next_acceptor: AtomicU64,
    clocks: Arc<Clocks>,
    stopped: AtomicBool,
}

impl ChannelPool {
    /// Validate `config`, start its event manager threads and return the
    /// running pool. Sockets come from [`TcpSocketFactory`].
    pub fn start(config: PoolConfig, handler: Arc<dyn Handler>) -> PoolResult<Self> {
        Self::with_socket_factory(config, handler, Arc::new(TcpSocketFactory::new()))
    }

    pub fn with_socket_factory(
        config: PoolConfig,
        handler: Arc<dyn Handler>,
        factory: Arc<dyn SocketFactory>,
    ) -> PoolResult<Self> {
        config.validate()?;

        let buffers: Arc<dyn BufferPool> = match config.max_buffers {
            None => Arc::new(HeapBufferPool::new(config.buffer_size)),
            Some(count) => Arc::new(FixedBufferPool::new(config.buffer_size, count)),
        };

        let mut managers: Vec<Arc<dyn EventManager>> =
            Vec::with_capacity(config.num_event_managers);
        for index in 0..config.num_event_managers {
            match MioEventManager::spawn(index, config.events_capacity) {
                Ok(manager) => managers.push(manager),
                Err(e) => {
                    for manager in &managers {
                        manager.stop();
                    }
                    return Err(e.into());
                }
            }
        }

        info!(
            managers = config.num_event_managers,
            high_watermark = config.high_watermark,
            low_watermark = config.low_watermark,
            assignment = ?config.assignment,
            "channel pool started"
        );

        let shared = Arc::new(PoolShared::new(config, handler, buffers, factory, managers));
        Ok(Self {
            clocks: Arc::new(Clocks::new(Arc::downgrade(&shared))),
            shared,
            acceptors: Mutex::new(HashMap::new()),
            next_acceptor: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    fn check_running(&self) -> PoolResult<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(PoolError::Stopped);
        }
        Ok(())
    }

    fn channel(&self, id: ChannelId) -> PoolResult<Arc<Channel>> {
        self.shared
            .registry
            .find(id)
            .ok_or(PoolError::InvalidChannel(id))
    }

    /// Queue `job` for `channel` on its manager. A stopped manager means
    /// the channel can never run again, so it is torn down on the spot.
    fn submit(channel: &Arc<Channel>, job: impl FnOnce(&Arc<Channel>) + Send + 'static) -> PoolResult<()> {
        let ch = channel.clone();
        match channel.manager().execute(Box::new(move || job(&ch))) {
            Ok(()) => Ok(()),
            Err(_) => {
                channel.close_quietly();
                Err(PoolError::Stopped)
            }
        }
    }

    // ── Channel creation ─────────────────────────────────────────────

    /// Bind `addr` and accept connections on it. Accepted channels report
    /// the returned id as their source id.
    pub fn listen(&self, addr: SocketAddr, backlog: u32, options: ListenOptions) -> PoolResult<AcceptorId> {
        self.check_running()?;
        if backlog == 0 {
            return Err(PoolError::InvalidConfig("listen backlog must be at least 1"));
        }

        let listener = self
            .shared
            .factory
            .listen(addr, backlog, &self.shared.config.socket_options())
            .map_err(|e| match e.kind() {
                io::ErrorKind::AddrInUse => PoolError::AddressInUse(addr),
                _ => PoolError::Io(e),
            })?;

        let index = match options.manager_hint {
            Some(hint) if hint >= self.shared.managers.len() => {
                return Err(PoolError::InvalidConfig("listen manager hint out of range"));
            }
            Some(hint) => hint,
            None => self.shared.pick_any_manager(),
        };
        let id = AcceptorId(self.next_acceptor.fetch_add(1, Ordering::Relaxed));
        let manager = self.shared.managers[index].clone();
        let acceptor = Arc::new(Acceptor::new(id, manager, self.shared.clone(), listener, options)?);
        acceptor.start()?;
        self.acceptors.lock().insert(id, acceptor);
        Ok(id)
    }

    /// Start a non-blocking connect. The channel exists (in `Connecting`)
    /// as soon as this returns; `Up` or `Down` follows on its manager.
    pub fn connect(&self, addr: SocketAddr, options: ConnectOptions) -> PoolResult<ChannelId> {
        self.check_running()?;
        let config = &self.shared.config;
        let state = ConnectState::new(
            addr,
            config.socket_options(),
            options.timeout.unwrap_or(config.connect_timeout),
            options.retry_interval.unwrap_or(config.connect_retry_interval),
            options.max_attempts,
        );
        let channel = self.shared.open_channel(
            ChannelKind::Connected,
            options.source_id,
            options.channel(),
            None,
            Some(state),
        )?;
        debug!(channel = %channel.id(), %addr, "connect requested");
        Self::submit(&channel, |ch| ch.start_connect())?;
        Ok(channel.id())
    }

    /// Adopt an already-connected non-blocking socket.
    pub fn import(&self, socket: Box<dyn Socket>, options: ImportOptions) -> PoolResult<ChannelId> {
        self.check_running()?;
        let channel = self.shared.open_channel(
            ChannelKind::Imported,
            options.source_id,
            options.channel(),
            Some(socket),
            None,
        )?;
        Self::submit(&channel, |ch| ch.start())?;
        Ok(channel.id())
    }

    /// [`import`](Self::import) for a connected std stream; switches it to
    /// non-blocking and applies the pool's socket options.
    pub fn import_std(&self, stream: std::net::TcpStream, options: ImportOptions) -> PoolResult<ChannelId> {
        let socket = TcpSocket::from_std(stream)?;
        socket.apply_options(&self.shared.config.socket_options())?;
        self.import(Box::new(socket), options)
    }

    // ── Channel operations ───────────────────────────────────────────

    /// Queue `data` on the channel. Fails with `Backpressure` once the
    /// channel went above its high-water mark (or ran out of buffers),
    /// until `WritableAgain` is delivered.
    pub fn write(&self, id: ChannelId, data: &[u8]) -> PoolResult<()> {
        self.channel(id)?.write(data)
    }

    /// [`write`](Self::write), also refused while the channel holds more
    /// than `enqueue_watermark` bytes. Only this call is refused: no
    /// backpressure events follow.
    pub fn write_with_watermark(&self, id: ChannelId, data: &[u8], enqueue_watermark: usize) -> PoolResult<()> {
        self.channel(id)?.write_limited(data, Some(enqueue_watermark))
    }

    /// Close a channel, or one half of it.
    ///
    /// For `Graceful` and `Immediate` the id is invalid once this returns
    /// and `Down` follows on the channel's manager. `Read` and `Write`
    /// keep the channel registered until both halves are closed.
    pub fn shutdown(&self, id: ChannelId, mode: ShutdownMode) -> PoolResult<()> {
        let channel = match mode {
            ShutdownMode::Read | ShutdownMode::Write => self.channel(id)?,
            ShutdownMode::Graceful | ShutdownMode::Immediate => {
                let mut closing = self.shared.closing.lock();
                let channel = self
                    .shared
                    .registry
                    .remove(id)
                    .ok_or(PoolError::InvalidChannel(id))?;
                if !channel.is_down() {
                    closing.insert(id, channel.clone());
                }
                channel
            }
        };
        debug!(channel = %id, ?mode, "shutdown requested");
        Self::submit(&channel, move |ch| ch.shutdown(mode))
    }

    pub fn enable_read(&self, id: ChannelId) -> PoolResult<()> {
        Self::submit(&self.channel(id)?, |ch| ch.set_read_enabled(true))
    }

    pub fn disable_read(&self, id: ChannelId) -> PoolResult<()> {
        Self::submit(&self.channel(id)?, |ch| ch.set_read_enabled(false))
    }

    pub fn set_write_watermarks(&self, id: ChannelId, low: usize, high: usize) -> PoolResult<()> {
        self.channel(id)?.set_watermarks(low, high)
    }

    /// `(low, high)` water marks of a channel.
    pub fn write_watermarks(&self, id: ChannelId) -> PoolResult<(usize, usize)> {
        Ok(self.channel(id)?.watermarks())
    }

    pub fn channel_stats(&self, id: ChannelId) -> PoolResult<ChannelStats> {
        Ok(self.channel(id)?.stats())
    }

    /// Restart the recorded maximum from the current outbound size.
    pub fn reset_recorded_max_write_cache(&self, id: ChannelId) -> PoolResult<()> {
        self.channel(id)?.reset_write_cache_max();
        Ok(())
    }

    pub fn set_channel_context(&self, id: ChannelId, context: Option<ChannelContext>) -> PoolResult<()> {
        self.channel(id)?.set_context(context);
        Ok(())
    }

    pub fn channel_context(&self, id: ChannelId) -> PoolResult<Option<ChannelContext>> {
        Ok(self.channel(id)?.context())
    }

    pub fn peer_address(&self, id: ChannelId) -> PoolResult<SocketAddr> {
        self.channel(id)?
            .peer_addr()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    pub fn local_address(&self, id: ChannelId) -> PoolResult<SocketAddr> {
        self.channel(id)?
            .local_addr()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotConnected).into())
    }

    // ── Acceptors ────────────────────────────────────────────────────

    /// Stop listening. Channels already accepted stay up.
    pub fn close(&self, acceptor: AcceptorId) -> PoolResult<()> {
        let acceptor = self
            .acceptors
            .lock()
            .remove(&acceptor)
            .ok_or(PoolError::InvalidAcceptor(acceptor))?;
        let closing = acceptor.clone();
        if acceptor
            .manager()
            .execute(Box::new(move || closing.close()))
            .is_err()
        {
            acceptor.close();
        }
        Ok(())
    }

    pub fn acceptor_address(&self, acceptor: AcceptorId) -> PoolResult<SocketAddr> {
        self.acceptors
            .lock()
            .get(&acceptor)
            .map(|a| a.local_addr())
            .ok_or(PoolError::InvalidAcceptor(acceptor))
    }

    // ── Clocks ───────────────────────────────────────────────────────

    /// Call `f` at `start`, then every `period` if given. With `channel`
    /// the clock runs on that channel's manager and ends with it.
    pub fn register_clock<F>(
        &self,
        id: ClockId,
        start: Instant,
        period: Option<Duration>,
        channel: Option<ChannelId>,
        f: F,
    ) -> PoolResult<()>
    where
        F: Fn(ClockId) + Send + Sync + 'static,
    {
        self.check_running()?;
        let manager = match channel {
            Some(channel) => self.channel(channel)?.manager().clone(),
            None => self.shared.managers[self.shared.pick_any_manager()].clone(),
        };
        let callback: ClockCallback = Arc::new(f);
        self.clocks
            .register(id, manager, start, period, channel, callback)
    }

    pub fn deregister_clock(&self, id: ClockId) -> PoolResult<()> {
        self.clocks.deregister(id)
    }

    // ── Statistics ───────────────────────────────────────────────────

    pub fn num_channels(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.counters.snapshot(self.num_channels())
    }

    pub fn manager_stats(&self) -> Vec<ManagerStats> {
        self.shared
            .managers
            .iter()
            .zip(&self.shared.load)
            .map(|(manager, load)| ManagerStats {
                index: manager.index(),
                num_channels: load.load(Ordering::Relaxed),
                num_sockets: manager.num_sockets(),
                num_timers: manager.num_timers(),
            })
            .collect()
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Close every listener and channel (`Down(PoolStopped)`), then stop
    /// and join the manager threads. No callback runs after this returns.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(channels = self.num_channels(), "stopping channel pool");

        let acceptors: Vec<Arc<Acceptor>> = self.acceptors.lock().drain().map(|(_, a)| a).collect();
        for acceptor in acceptors {
            acceptor.close();
        }
        self.clocks.clear();

        let channels: Vec<Arc<Channel>> = {
            let mut closing = self.shared.closing.lock();
            let mut channels = self.shared.registry.drain();
            channels.extend(closing.drain().map(|(_, channel)| channel));
            channels
        };
        for channel in channels {
            let ch = channel.clone();
            if channel
                .manager()
                .execute(Box::new(move || ch.close(DownReason::PoolStopped)))
                .is_err()
            {
                channel.close_quietly();
            }
        }

        for manager in &self.shared.managers {
            manager.stop();
        }
        info!("channel pool stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl Drop for ChannelPool {
    fn drop(&mut self) {
        self.stop();
    }
}
