//! Client clocks: one-shot or periodic callbacks on a manager thread.
//!
//! A clock bound to a channel runs on that channel's manager and is
//! dropped silently once the channel is gone. Each entry carries a
//! generation so a fire that races a deregister (or a re-register under
//! the same id) is recognised as stale.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chanpool_core::{ChannelId, ClockId, EventManager, TimerId};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::error::{PoolError, PoolResult};
use crate::shared::PoolShared;

pub type ClockCallback = Arc<dyn Fn(ClockId) + Send + Sync>;

struct ClockEntry {
    generation: u64,
    manager: Arc<dyn EventManager>,
    timer: TimerId,
    period: Option<Duration>,
    channel: Option<ChannelId>,
    callback: ClockCallback,
}

pub(crate) struct Clocks {
    entries: Mutex<HashMap<ClockId, ClockEntry>>,
    next_generation: AtomicU64,
    shared: Weak<PoolShared>,
}

impl Clocks {
    pub fn new(shared: Weak<PoolShared>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shared,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Schedule `callback` at `start`, then every `period` if given.
    pub fn register(
        self: &Arc<Self>,
        id: ClockId,
        manager: Arc<dyn EventManager>,
        start: Instant,
        period: Option<Duration>,
        channel: Option<ChannelId>,
        callback: ClockCallback,
    ) -> PoolResult<()> {
        if period.is_some_and(|p| p.is_zero()) {
            return Err(PoolError::InvalidConfig("clock period must be non-zero"));
        }
        let mut entries = self.entries.lock();
        if entries.contains_key(&id) {
            return Err(PoolError::ClockExists(id));
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let timer = self.schedule(&manager, id, generation, start);
        entries.insert(
            id,
            ClockEntry {
                generation,
                manager,
                timer,
                period,
                channel,
                callback,
            },
        );
        debug!(clock = %id, ?period, ?channel, "clock registered");
        Ok(())
    }

    fn schedule(
        self: &Arc<Self>,
        manager: &Arc<dyn EventManager>,
        id: ClockId,
        generation: u64,
        at: Instant,
    ) -> TimerId {
        let clocks = Arc::downgrade(self);
        manager.register_timer(
            at,
            Box::new(move || {
                if let Some(clocks) = clocks.upgrade() {
                    clocks.fire(id, generation, at);
                }
            }),
        )
    }

    fn fire(self: &Arc<Self>, id: ClockId, generation: u64, due: Instant) {
        let callback = {
            let mut entries = self.entries.lock();
            let entry = match entries.get(&id) {
                Some(entry) if entry.generation == generation => entry,
                _ => return,
            };
            if let Some(channel) = entry.channel {
                let alive = self
                    .shared
                    .upgrade()
                    .is_some_and(|shared| shared.registry.find(channel).is_some());
                if !alive {
                    debug!(clock = %id, %channel, "clock dropped with its channel");
                    entries.remove(&id);
                    return;
                }
            }
            let callback = entry.callback.clone();
            let period = entry.period;

            match period {
                Some(period) => {
                    let now = Instant::now();
                    let mut next = due + period;
                    if next <= now {
                        next = now + period;
                    }
                    let manager = entry.manager.clone();
                    let timer = self.schedule(&manager, id, generation, next);
                    if let Some(entry) = entries.get_mut(&id) {
                        entry.timer = timer;
                    }
                }
                None => {
                    entries.remove(&id);
                }
            }
            callback
        };

        if panic::catch_unwind(AssertUnwindSafe(|| callback(id))).is_err() {
            error!(clock = %id, "clock callback panicked");
        }
    }

    pub fn deregister(&self, id: ClockId) -> PoolResult<()> {
        let entry = self
            .entries
            .lock()
            .remove(&id)
            .ok_or(PoolError::InvalidClock(id))?;
        entry.manager.cancel_timer(entry.timer);
        debug!(clock = %id, "clock deregistered");
        Ok(())
    }

    pub fn clear(&self) {
        let drained: Vec<ClockEntry> = self.entries.lock().drain().map(|(_, e)| e).collect();
        for entry in drained {
            entry.manager.cancel_timer(entry.timer);
        }
    }
}
