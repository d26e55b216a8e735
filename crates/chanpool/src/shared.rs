//! State shared by the pool, its channels and its acceptors.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chanpool_core::{BufferPool, ChannelId, EventManager, SocketFactory, SourceId};
use chanpool_core::Socket;
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::channel::{Channel, ChannelKind};
use crate::config::{AssignmentPolicy, PoolConfig};
use crate::connector::ConnectState;
use crate::error::{PoolError, PoolResult};
use crate::event::{Handler, PoolEvent};
use crate::options::ChannelOptions;
use crate::registry::ChannelRegistry;
use crate::stats::PoolCounters;

pub(crate) struct PoolShared {
    pub config: PoolConfig,
    pub handler: Arc<dyn Handler>,
    pub registry: ChannelRegistry,
    /// Channels taken out of the registry by `shutdown` that are not down
    /// yet. `stop` closes them with the registry's. Locked before the
    /// registry.
    pub closing: Mutex<HashMap<ChannelId, Arc<Channel>>>,
    pub buffers: Arc<dyn BufferPool>,
    pub factory: Arc<dyn SocketFactory>,
    pub managers: Vec<Arc<dyn EventManager>>,
    /// Live channels per manager.
    pub load: Vec<AtomicUsize>,
    next_manager: AtomicUsize,
    pub counters: PoolCounters,
}

impl PoolShared {
    pub fn new(
        config: PoolConfig,
        handler: Arc<dyn Handler>,
        buffers: Arc<dyn BufferPool>,
        factory: Arc<dyn SocketFactory>,
        managers: Vec<Arc<dyn EventManager>>,
    ) -> Self {
        let load = managers.iter().map(|_| AtomicUsize::new(0)).collect();
        Self {
            config,
            handler,
            registry: ChannelRegistry::new(),
            closing: Mutex::new(HashMap::new()),
            buffers,
            factory,
            managers,
            load,
            next_manager: AtomicUsize::new(0),
            counters: PoolCounters::default(),
        }
    }

    fn round_robin(&self) -> usize {
        self.next_manager.fetch_add(1, Ordering::Relaxed) % self.managers.len()
    }

    /// Manager for a new channel, per the configured policy.
    pub fn pick_manager(&self) -> usize {
        match self.config.assignment {
            AssignmentPolicy::RoundRobin => self.round_robin(),
            AssignmentPolicy::LeastLoaded => self
                .load
                .iter()
                .enumerate()
                .min_by_key(|(_, load)| load.load(Ordering::Relaxed))
                .map_or(0, |(index, _)| index),
        }
    }

    /// Manager for a listener or a free-standing clock.
    pub fn pick_any_manager(&self) -> usize {
        self.round_robin()
    }

    /// Create a channel, assign it a manager and register it. The caller
    /// queues its start job.
    pub fn open_channel(
        self: &Arc<Self>,
        kind: ChannelKind,
        source_id: SourceId,
        options: ChannelOptions,
        socket: Option<Box<dyn Socket>>,
        connect: Option<ConnectState>,
    ) -> PoolResult<Arc<Channel>> {
        let index = self.pick_manager();
        let manager = self.managers[index].clone();
        let shared = self.clone();

        let channel = self
            .registry
            .insert(self.config.max_connections, move |id| {
                Arc::new(Channel::new(id, kind, source_id, manager, shared, options, socket, connect))
            })
            .ok_or(PoolError::ChannelLimit)?;

        self.load[index].fetch_add(1, Ordering::Relaxed);
        self.counters.channels_opened.fetch_add(1, Ordering::Relaxed);
        debug!(channel = %channel.id(), manager = index, ?kind, source = %source_id, "channel opened");
        Ok(channel)
    }

    /// Called exactly once per channel, when it goes down.
    pub fn channel_closed(&self, manager_index: usize) {
        self.load[manager_index].fetch_sub(1, Ordering::Relaxed);
        self.counters.channels_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn notify_pool(&self, event: PoolEvent) {
        let handler = &self.handler;
        if panic::catch_unwind(AssertUnwindSafe(|| handler.pool_state(&event))).is_err() {
            error!(?event, "pool event handler panicked");
        }
    }
}
