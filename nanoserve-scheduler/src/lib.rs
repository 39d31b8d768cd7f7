//! nanoserve scheduler: adaptive batch sizing and the FCFS request queue.

pub mod adaptive;
pub mod queue;
pub mod sequence;

pub use adaptive::{AdaptiveBatchController, BatchState, BatchStats};
pub use queue::BatchScheduler;
pub use sequence::QueuedSequence;
