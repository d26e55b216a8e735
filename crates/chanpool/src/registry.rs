//! Concurrent channel catalog.
//!
//! Ids are issued under the same lock that guards the map, starting at 1,
//! and never reused.

use std::collections::HashMap;
use std::sync::Arc;

use chanpool_core::ChannelId;
use parking_lot::Mutex;

use crate::channel::Channel;

pub type ChannelRegistry = Registry<Channel>;

pub struct Registry<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    entries: HashMap<ChannelId, Arc<T>>,
    last: ChannelId,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                last: ChannelId::NONE,
            }),
        }
    }

    /// Allocate the next id and store what `build` makes for it. Returns
    /// `None` without calling `build` when `limit` entries are already
    /// registered.
    pub fn insert<F>(&self, limit: Option<usize>, build: F) -> Option<Arc<T>>
    where
        F: FnOnce(ChannelId) -> Arc<T>,
    {
        let mut inner = self.inner.lock();
        if limit.is_some_and(|max| inner.entries.len() >= max) {
            return None;
        }
        let id = inner.last.next();
        inner.last = id;
        let entry = build(id);
        inner.entries.insert(id, entry.clone());
        Some(entry)
    }

    pub fn find(&self, id: ChannelId) -> Option<Arc<T>> {
        self.inner.lock().entries.get(&id).cloned()
    }

    /// Remove and return the entry. Other holders keep it alive.
    pub fn remove(&self, id: ChannelId) -> Option<Arc<T>> {
        self.inner.lock().entries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<Arc<T>> {
        self.inner.lock().entries.drain().map(|(_, entry)| entry).collect()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_ids_monotonic_never_reused() {
        let registry: Registry<String> = Registry::new();
        let a = registry.insert(None, |id| Arc::new(format!("a{}", id))).unwrap();
        let b = registry.insert(None, |id| Arc::new(format!("b{}", id))).unwrap();
        assert_eq!(*a, "a1");
        assert_eq!(*b, "b2");

        registry.remove(ChannelId::new(2));
        let c = registry.insert(None, |id| Arc::new(format!("c{}", id))).unwrap();
        assert_eq!(*c, "c3");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_remove_keeps_other_holders() {
        let registry: Registry<u32> = Registry::new();
        let held = registry.insert(None, |_| Arc::new(5)).unwrap();
        let removed = registry.remove(ChannelId::new(1)).unwrap();
        assert!(registry.find(ChannelId::new(1)).is_none());
        assert!(registry.remove(ChannelId::new(1)).is_none());
        assert_eq!(Arc::strong_count(&held), 2);
        drop(removed);
        assert_eq!(*held, 5);
    }

    #[test]
    fn test_limit() {
        let registry: Registry<u8> = Registry::new();
        assert!(registry.insert(Some(1), |_| Arc::new(0)).is_some());
        let mut called = false;
        assert!(registry
            .insert(Some(1), |_| {
                called = true;
                Arc::new(1)
            })
            .is_none());
        assert!(!called);
    }

    #[test]
    fn test_concurrent_inserts_unique() {
        let registry: Arc<Registry<u64>> = Arc::new(Registry::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || {
                    (0..250)
                        .map(|_| {
                            let mut got = ChannelId::NONE;
                            registry.insert(None, |id| {
                                got = id;
                                Arc::new(id.as_u64())
                            });
                            got
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<ChannelId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 1000);
        assert_eq!(registry.len(), 1000);
    }
}
