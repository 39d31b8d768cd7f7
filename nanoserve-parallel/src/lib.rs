//! nanoserve tensor parallelism: a shard coordinator over a pluggable
//! collective, plus an in-process worker group.

pub mod collective;
pub mod coordinator;
pub mod local;

pub use collective::Collective;
pub use coordinator::{ParallelMode, ShardCoordinator};
pub use local::{LocalProcessGroup, LocalRank};
