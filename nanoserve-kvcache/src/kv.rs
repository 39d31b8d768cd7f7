//! Cache of attention key/value states, keyed by the full input-id sequence.

use nanoserve_core::{KvState, Result, Tensor};

use crate::key::CacheKey;
use crate::store::{CacheStats, CacheStore, CacheValue};

impl<T: Tensor> CacheValue for KvState<T> {
    fn memory_bytes(&self) -> usize {
        self.size_bytes()
    }
}

pub struct KvCache<T: Tensor> {
    store: CacheStore<KvState<T>>,
}

impl<T: Tensor> KvCache<T> {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            store: CacheStore::new(capacity)?,
        })
    }

    pub fn derive_key(input_ids: &[u32]) -> CacheKey {
        CacheKey::from_token_ids(input_ids)
    }

    pub fn get(&self, key: &CacheKey) -> Option<KvState<T>> {
        self.store.get(key)
    }

    /// Store copies of `key_states` and `value_states` under `key`.
    pub fn put(&self, key: CacheKey, key_states: &T, value_states: &T) -> Option<CacheKey> {
        self.store.put(
            key,
            KvState {
                key_states: key_states.clone(),
                value_states: value_states.clone(),
            },
        )
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.store.contains(key)
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    pub fn clear(&self) {
        self.store.clear();
    }

    pub fn prune(&self) -> usize {
        self.store.prune()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.stats()
    }

    pub fn memory_bytes(&self) -> usize {
        self.store.memory_bytes()
    }

    pub fn memory_usage_mb(&self) -> f64 {
        self.memory_bytes() as f64 / (1024.0 * 1024.0)
    }
}
