use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Uneven shard: axis {axis} has size {size}, not divisible by world size {world_size}")]
    UnevenShard {
        axis: usize,
        size: usize,
        world_size: usize,
    },

    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// Failure reported by the model runtime or the tokenizer.
    #[error("Upstream failure: {0}")]
    Upstream(String),

    #[error("Collective error: {0}")]
    Collective(String),

    #[error("Request not found: {0}")]
    SeqNotFound(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, ServeError>;
