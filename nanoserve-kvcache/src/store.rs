//! Bounded key/value store with usage-counted eviction.
//!
//! Every entry carries the number of times it has been served. When the store
//! is full, `put` first evicts the entry with the fewest uses; among equally
//! used entries the one inserted earliest goes first. All state sits behind a
//! single mutex, so the evict-then-insert sequence is atomic with respect to
//! concurrent `get`/`put` calls and the capacity bound holds under contention.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use nanoserve_core::{Result, ServeError};
use tracing::debug;

use crate::key::CacheKey;

/// Values a [`CacheStore`] can hold.
pub trait CacheValue: Clone + Send {
    /// Bytes attributed to this value in [`CacheStats::memory_bytes`].
    fn memory_bytes(&self) -> usize;
}

impl CacheValue for Vec<u32> {
    fn memory_bytes(&self) -> usize {
        self.len() * std::mem::size_of::<u32>()
    }
}

/// Point-in-time statistics of a store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub requests: u64,
    /// `hits / max(requests, 1)`, always in `[0, 1]`.
    pub hit_rate: f64,
    pub entry_count: usize,
    pub capacity: usize,
    pub memory_bytes: usize,
}

struct Entry<V> {
    value: V,
    usage_count: u64,
    /// Insertion order; breaks usage-count ties.
    created_at: u64,
    last_used: u64,
}

struct Inner<V> {
    entries: HashMap<CacheKey, Entry<V>>,
    clock: u64,
    hits: u64,
    requests: u64,
}

impl<V> Inner<V> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn prune_below(&mut self, min_usage: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.usage_count >= min_usage);
        let removed = before - self.entries.len();
        debug!(removed, min_usage, "pruned cache");
        removed
    }

    fn victim(&self) -> Option<CacheKey> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.usage_count, e.created_at))
            .map(|(k, _)| *k)
    }
}

pub struct CacheStore<V: CacheValue> {
    capacity: usize,
    inner: Mutex<Inner<V>>,
}

impl<V: CacheValue> CacheStore<V> {
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(ServeError::InvalidConfig(
                "cache capacity must be positive".into(),
            ));
        }
        Ok(Self {
            capacity,
            inner: Mutex::new(Inner {
                entries: HashMap::with_capacity(capacity),
                clock: 0,
                hits: 0,
                requests: 0,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<V>> {
        // No operation panics mid-update, so a poisoned store is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look up `key`. Counts as a served request whether or not it hits.
    pub fn get(&self, key: &CacheKey) -> Option<V> {
        let mut inner = self.lock();
        inner.requests += 1;
        let now = inner.tick();
        let hit = inner.entries.get_mut(key).map(|entry| {
            entry.usage_count += 1;
            entry.last_used = now;
            entry.value.clone()
        });
        if hit.is_some() {
            inner.hits += 1;
        }
        hit
    }

    /// Insert `value` under `key`, evicting one entry first if the store is
    /// full. Returns the evicted key, if any.
    ///
    /// Re-inserting an existing key replaces its value and restarts its
    /// usage count without evicting anything.
    pub fn put(&self, key: CacheKey, value: V) -> Option<CacheKey> {
        let mut inner = self.lock();
        let mut evicted = None;
        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.capacity {
            if let Some(victim) = inner.victim() {
                inner.entries.remove(&victim);
                debug!(key = %victim, "evicted least used cache entry");
                evicted = Some(victim);
            }
        }
        let now = inner.tick();
        inner.entries.insert(
            key,
            Entry {
                value,
                usage_count: 1,
                created_at: now,
                last_used: now,
            },
        );
        evicted
    }

    /// Membership test that does not count as a request.
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.lock().entries.contains_key(key)
    }

    pub fn usage_count(&self, key: &CacheKey) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.usage_count)
    }

    /// Clock value of the entry's most recent insertion or hit.
    pub fn last_used(&self, key: &CacheKey) -> Option<u64> {
        self.lock().entries.get(key).map(|e| e.last_used)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry. Hit and request counters are kept.
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.entries.clear();
        inner.entries.shrink_to_fit();
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            hits: inner.hits,
            requests: inner.requests,
            hit_rate: inner.hits as f64 / inner.requests.max(1) as f64,
            entry_count: inner.entries.len(),
            capacity: self.capacity,
            memory_bytes: inner.entries.values().map(|e| e.value.memory_bytes()).sum(),
        }
    }

    pub fn memory_bytes(&self) -> usize {
        self.lock()
            .entries
            .values()
            .map(|e| e.value.memory_bytes())
            .sum()
    }

    /// Remove entries used fewer than `max(1, requests / 100)` times.
    /// Returns how many were removed.
    pub fn prune(&self) -> usize {
        let mut inner = self.lock();
        let threshold = (inner.requests / 100).max(1);
        inner.prune_below(threshold)
    }

    /// Remove every entry whose usage count is below `min_usage`.
    pub fn prune_below(&self, min_usage: u64) -> usize {
        self.lock().prune_below(min_usage)
    }
}
