//! nanoserve caches: a usage-counted key/value store and its KV-state and
//! prompt-prefix specializations.

pub mod key;
pub mod kv;
pub mod prefix;
pub mod store;

pub use key::CacheKey;
pub use kv::KvCache;
pub use prefix::PrefixCache;
pub use store::{CacheStats, CacheStore, CacheValue};
