//! A bounded map whose entries expire a fixed time after insertion, and a
//! registry of live values that providers refresh in place.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted_at: Instant,
    last_used: Instant,
}

impl<V> Entry<V> {
    fn is_expired(&self, ttl: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) > ttl
    }
}

/// Cache statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub size: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

struct State<K, V> {
    entries: HashMap<K, Entry<V>>,
    hits: u64,
    misses: u64,
}

/// Expiring cache guarded by one mutex.
///
/// The lock is held for the map operation only. Values are usually `Arc`s
/// and are cloned out.
pub struct ExpiringCache<K, V> {
    state: Mutex<State<K, V>>,
    ttl: Duration,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> ExpiringCache<K, V> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(State {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            ttl,
            capacity: capacity.max(1),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Returns a live entry, dropping it if it has expired.
    pub fn get(&self, key: &K, now: Instant) -> Option<V> {
        let mut state = self.state.lock();
        let expired = match state.entries.get_mut(key) {
            Some(entry) if !entry.is_expired(self.ttl, now) => {
                entry.last_used = now;
                let value = entry.value.clone();
                state.hits += 1;
                return Some(value);
            }
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.remove(key);
        }
        state.misses += 1;
        None
    }

    /// Inserts `value`, evicting expired entries and then the least recently
    /// used ones until the cache fits its capacity.
    pub fn insert(&self, key: K, value: V, now: Instant) {
        let mut state = self.state.lock();
        state.entries.insert(
            key,
            Entry {
                value,
                inserted_at: now,
                last_used: now,
            },
        );
        if state.entries.len() > self.capacity {
            let ttl = self.ttl;
            state.entries.retain(|_, entry| !entry.is_expired(ttl, now));
        }
        while state.entries.len() > self.capacity {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    state.entries.remove(&key);
                }
                None => break,
            }
        }
    }

    /// Returns the cached value, or inserts the one `make` builds.
    ///
    /// `make` runs without the lock held, so two callers racing on the same
    /// key may both build a value; the later insert wins.
    pub fn get_or_insert_with(&self, key: K, now: Instant, make: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key, now) {
            return value;
        }
        let value = make();
        self.insert(key, value.clone(), now);
        value
    }

    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            size: state.entries.len(),
            capacity: self.capacity,
            hits: state.hits,
            misses: state.misses,
        }
    }
}

/// Weak handles to values kept current by whoever created them.
///
/// Registration and refresh take the same lock. A value registered while a
/// refresh is pending is either filled after that refresh's read or visited
/// by it.
pub struct LiveHandles<T> {
    handles: Mutex<Vec<Weak<T>>>,
}

impl<T> LiveHandles<T> {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Registers `handle` and runs `fill` on it under the registry lock.
    pub fn register(&self, handle: &Arc<T>, fill: impl FnOnce(&T)) {
        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        handles.push(Arc::downgrade(handle));
        fill(handle);
    }

    /// Runs `refresh` over every live handle under the registry lock.
    pub fn refresh(&self, refresh: impl FnOnce(&[Arc<T>])) {
        let mut handles = self.handles.lock();
        handles.retain(|weak| weak.strong_count() > 0);
        let live: Vec<Arc<T>> = handles.iter().filter_map(Weak::upgrade).collect();
        refresh(&live);
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Default for LiveHandles<T> {
    fn default() -> Self {
        Self::new()
    }
}
