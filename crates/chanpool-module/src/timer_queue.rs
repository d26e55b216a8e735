//! BinaryHeap-based timer queue for one event manager
//!
//! # Complexity
//!
//! - Insert: O(log n)
//! - Cancel: O(1) (lazy)
//! - Pop expired: O(k log n) where k = number of expired timers
//! - Next deadline: O(1) amortized
//!
//! # Cancellation Strategy
//!
//! The heap only orders `(deadline, id)` pairs; callbacks live in a side
//! map. Cancelling removes the callback from the map right away, so
//! whatever it captured (typically an `Arc<Channel>`) is released at cancel
//! time rather than at the deadline. The stale heap key is skipped when it
//! reaches the top.

use std::collections::{BinaryHeap, HashMap};
use std::cmp::Ordering;
use std::time::Instant;

use chanpool_core::{TimerCallback, TimerId};
use parking_lot::Mutex;

/// Min-heap key: earliest deadline first, ties broken by id so timers
/// registered for the same instant fire in registration order.
#[derive(PartialEq, Eq)]
struct HeapKey {
    deadline: Instant,
    id: TimerId,
}

impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.deadline.cmp(&self.deadline) {
            Ordering::Equal => other.id.cmp(&self.id),
            ord => ord,
        }
    }
}

struct Inner {
    heap: BinaryHeap<HeapKey>,
    callbacks: HashMap<TimerId, TimerCallback>,
    total_inserted: u64,
    total_fired: u64,
    total_cancelled: u64,
}

impl Inner {
    /// Drop cancelled keys sitting at the top of the heap.
    fn prune(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.callbacks.contains_key(&top.id) {
                break;
            }
            self.heap.pop();
        }
    }
}

/// Timer queue guarded by an internal mutex.
///
/// Foreign threads insert and cancel; the owning manager thread pops.
/// The lock is never held while a callback runs.
pub struct TimerQueue {
    inner: Mutex<Inner>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::with_capacity(256)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::with_capacity(capacity),
                callbacks: HashMap::with_capacity(capacity),
                total_inserted: 0,
                total_fired: 0,
                total_cancelled: 0,
            }),
        }
    }

    /// Schedule `callback` at `deadline`.
    pub fn insert(&self, deadline: Instant, callback: TimerCallback) -> TimerId {
        let id = TimerId::next();
        let mut inner = self.inner.lock();
        inner.heap.push(HeapKey { deadline, id });
        inner.callbacks.insert(id, callback);
        inner.total_inserted += 1;
        id
    }

    /// Cancel a pending timer. Returns `false` if it already fired or was
    /// already cancelled.
    pub fn cancel(&self, id: TimerId) -> bool {
        let removed = {
            let mut inner = self.inner.lock();
            let removed = inner.callbacks.remove(&id);
            if removed.is_some() {
                inner.total_cancelled += 1;
                inner.prune();
            }
            removed
        };
        // Captured state is dropped outside the lock.
        removed.is_some()
    }

    /// Remove and return every callback due at or before `now`, in deadline
    /// order.
    pub fn pop_expired(&self, now: Instant) -> Vec<TimerCallback> {
        let mut inner = self.inner.lock();
        let mut expired = Vec::new();

        while let Some(top) = inner.heap.peek() {
            if top.deadline > now {
                break;
            }
            let key = match inner.heap.pop() {
                Some(key) => key,
                None => break,
            };
            if let Some(callback) = inner.callbacks.remove(&key.id) {
                inner.total_fired += 1;
                expired.push(callback);
            }
        }

        if inner.callbacks.is_empty() {
            inner.heap.clear();
        }
        expired
    }

    /// Deadline of the earliest live timer.
    pub fn next_deadline(&self) -> Option<Instant> {
        let mut inner = self.inner.lock();
        inner.prune();
        inner.heap.peek().map(|key| key.deadline)
    }

    /// Number of live (non-cancelled, unfired) timers.
    pub fn len(&self) -> usize {
        self.inner.lock().callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending timer without running it.
    pub fn clear(&self) {
        let drained: Vec<TimerCallback> = {
            let mut inner = self.inner.lock();
            inner.heap.clear();
            inner.callbacks.drain().map(|(_, cb)| cb).collect()
        };
        drop(drained);
    }

    pub fn stats(&self) -> TimerQueueStats {
        let inner = self.inner.lock();
        TimerQueueStats {
            active: inner.callbacks.len(),
            stale_keys: inner.heap.len().saturating_sub(inner.callbacks.len()),
            total_inserted: inner.total_inserted,
            total_fired: inner.total_fired,
            total_cancelled: inner.total_cancelled,
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Statistics for `TimerQueue`
#[derive(Debug, Clone)]
pub struct TimerQueueStats {
    /// Live timers
    pub active: usize,
    /// Cancelled keys still in the heap
    pub stale_keys: usize,
    pub total_inserted: u64,
    pub total_fired: u64,
    pub total_cancelled: u64,
}
