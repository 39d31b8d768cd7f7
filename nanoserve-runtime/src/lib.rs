//! nanoserve runtime: sampling, stop criteria, and the generation loop.

pub mod engine;
pub mod sampling;
pub mod stop;

pub use engine::{CancelHandle, EngineEvent, EngineStats, GenerationOrchestrator};
pub use sampling::{LogitProcessorPipeline, TokenSampler};
pub use stop::StopChecker;
