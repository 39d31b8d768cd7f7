use std::fmt;

use sha2::{Digest, Sha256};

/// SHA-256 digest of a cache entry's key material.
///
/// Distinct inputs that hash to the same digest would share one entry;
/// that is not detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// Key for a token sequence. Every id is hashed, in order.
    pub fn from_token_ids(ids: &[u32]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"nanoserve-kv-v1");
        hasher.update((ids.len() as u64).to_le_bytes());
        for id in ids {
            hasher.update(id.to_le_bytes());
        }
        CacheKey(hasher.finalize().into())
    }

    /// Key for the first `max_chars` characters of `text`.
    pub fn from_text_prefix(text: &str, max_chars: usize) -> Self {
        let end = text
            .char_indices()
            .nth(max_chars)
            .map(|(i, _)| i)
            .unwrap_or(text.len());
        let mut hasher = Sha256::new();
        hasher.update(b"nanoserve-prefix-v1");
        hasher.update(&text.as_bytes()[..end]);
        CacheKey(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0[..8] {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}
