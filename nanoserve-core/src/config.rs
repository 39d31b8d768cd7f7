use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Result, ServeError};

/// Engine-wide settings, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_kv_cache_capacity")]
    pub kv_cache_capacity: usize,
    #[serde(default = "default_prefix_cache_capacity")]
    pub prefix_cache_capacity: usize,
    /// Number of leading prompt characters that key the prefix cache.
    #[serde(default = "default_prefix_chars")]
    pub prefix_chars: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_tensor_parallel_size")]
    pub tensor_parallel_size: usize,
    /// Maximum prompt + completion length. Falls back to the model's
    /// position limit, then to 2048.
    #[serde(default)]
    pub max_model_len: Option<usize>,
    /// Memory the KV cache may occupy before batching backs off.
    #[serde(default)]
    pub kv_cache_memory_budget_bytes: Option<usize>,
    /// Cap batches at the controller's learned size as well as its
    /// reactive recommendation.
    #[serde(default)]
    pub use_learned_batch_size: bool,
}

fn default_kv_cache_capacity() -> usize {
    1000
}
fn default_prefix_cache_capacity() -> usize {
    100
}
fn default_prefix_chars() -> usize {
    100
}
fn default_min_batch_size() -> usize {
    1
}
fn default_max_batch_size() -> usize {
    32
}
fn default_tensor_parallel_size() -> usize {
    1
}

pub const DEFAULT_MAX_MODEL_LEN: usize = 2048;

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kv_cache_capacity: default_kv_cache_capacity(),
            prefix_cache_capacity: default_prefix_cache_capacity(),
            prefix_chars: default_prefix_chars(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            tensor_parallel_size: default_tensor_parallel_size(),
            max_model_len: None,
            kv_cache_memory_budget_bytes: None,
            use_learned_batch_size: false,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kv_cache_capacity == 0 || self.prefix_cache_capacity == 0 {
            return Err(ServeError::InvalidConfig(
                "cache capacities must be positive".into(),
            ));
        }
        if self.prefix_chars == 0 {
            return Err(ServeError::InvalidConfig(
                "prefix_chars must be positive".into(),
            ));
        }
        if self.min_batch_size == 0 || self.min_batch_size > self.max_batch_size {
            return Err(ServeError::InvalidConfig(format!(
                "batch bounds must satisfy 0 < min ({}) <= max ({})",
                self.min_batch_size, self.max_batch_size
            )));
        }
        if self.tensor_parallel_size == 0 {
            return Err(ServeError::InvalidConfig(
                "tensor_parallel_size must be at least 1".into(),
            ));
        }
        if self.max_model_len == Some(0) {
            return Err(ServeError::InvalidConfig(
                "max_model_len must be positive".into(),
            ));
        }
        Ok(())
    }
}
