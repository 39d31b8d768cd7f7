//! Cache of generated continuations keyed by a prompt's leading characters.
//!
//! Prompts that agree on their first `prefix_chars` characters share a key,
//! so a hit returns the continuation recorded for the *prefix*, which may
//! belong to a different full prompt.

use nanoserve_core::{Result, ServeError};

use crate::key::CacheKey;
use crate::store::{CacheStats, CacheStore};

pub const DEFAULT_PREFIX_CHARS: usize = 100;

pub struct PrefixCache {
    store: CacheStore<Vec<u32>>,
    prefix_chars: usize,
}

impl PrefixCache {
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_prefix_chars(capacity, DEFAULT_PREFIX_CHARS)
    }

    pub fn with_prefix_chars(capacity: usize, prefix_chars: usize) -> Result<Self> {
        if prefix_chars == 0 {
            return Err(ServeError::InvalidConfig(
                "prefix_chars must be positive".into(),
            ));
        }
        Ok(Self {
            store: CacheStore::new(capacity)?,
            prefix_chars,
        })
    }

    pub fn prefix_chars(&self) -> usize {
        self.prefix_chars
    }

    pub fn derive_key(&self, prompt: &str) -> CacheKey {
        CacheKey::from_text_prefix(prompt, self.prefix_chars)
    }

    pub fn get(&self, key: &CacheKey) -> Option<Vec<u32>> {
        self.store.get(key)
    }

    pub fn put(&self, key: CacheKey, tokens: &[u32]) -> Option<CacheKey> {
        self.store.put(key, tokens.to_vec())
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
}
