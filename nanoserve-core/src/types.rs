use serde::{Deserialize, Serialize};

use crate::{Result, ServeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    BF16,
    I8,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    MaxTokens,
    EosToken,
    StopSequence,
    Cancelled,
}

/// Position of this worker inside its tensor-parallel group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardDescriptor {
    world_size: usize,
    rank: usize,
}

impl ShardDescriptor {
    pub fn new(world_size: usize, rank: usize) -> Result<Self> {
        if world_size == 0 {
            return Err(ServeError::InvalidConfig(
                "world_size must be at least 1".into(),
            ));
        }
        if rank >= world_size {
            return Err(ServeError::InvalidConfig(format!(
                "rank {rank} out of range for world_size {world_size}"
            )));
        }
        Ok(Self { world_size, rank })
    }

    pub fn single() -> Self {
        Self {
            world_size: 1,
            rank: 0,
        }
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}
