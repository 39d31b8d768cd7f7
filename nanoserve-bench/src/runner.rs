//! Drives a workload through one engine, or one engine per rank.

use std::sync::Arc;
use std::thread;
use std::time::Instant;

use nanoserve_backend_cpu::{CpuBackend, CpuTensor};
use nanoserve_core::{
    EngineConfig, GenerationOutput, GenerationRequest, Model, Result, SamplingConfig, ServeError,
    ShardDescriptor, Tokenizer,
};
use nanoserve_parallel::{Collective, LocalProcessGroup, ShardCoordinator};
use nanoserve_runtime::{EngineStats, GenerationOrchestrator};
use tracing::{debug, info};

use crate::report::BenchReport;
use crate::synthetic::SyntheticModel;

#[derive(Debug, Clone, PartialEq)]
pub struct BenchOutcome {
    pub report: BenchReport,
    pub stats: EngineStats,
}

/// How requests reach the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// One `generate` call over every prompt.
    #[default]
    Direct,
    /// Queue every prompt and drain the queue in adaptively sized batches.
    Scheduled,
}

pub fn single_engine(
    config: EngineConfig,
    tokenizer: Arc<dyn Tokenizer>,
    vocab_size: usize,
) -> Result<GenerationOrchestrator<CpuBackend, SyntheticModel>> {
    let model = SyntheticModel::new(vocab_size, ShardDescriptor::single())?;
    let coordinator = ShardCoordinator::single(Arc::new(CpuBackend::new()));
    GenerationOrchestrator::new(model, Box::new(tokenizer), coordinator, config)
}

pub fn run_workload<M: Model<T = CpuTensor>>(
    engine: &GenerationOrchestrator<CpuBackend, M>,
    prompts: &[String],
    sampling: &SamplingConfig,
    mode: Mode,
) -> BenchOutcome {
    let start = Instant::now();
    let results = match mode {
        Mode::Direct => engine.generate(prompts, sampling),
        Mode::Scheduled => drain_queue(engine, prompts, sampling),
    };
    let report = BenchReport::from_results(&results, start.elapsed());
    BenchOutcome {
        report,
        stats: engine.cache_stats(),
    }
}

fn drain_queue<M: Model<T = CpuTensor>>(
    engine: &GenerationOrchestrator<CpuBackend, M>,
    prompts: &[String],
    sampling: &SamplingConfig,
) -> Vec<Result<GenerationOutput>> {
    for (i, prompt) in prompts.iter().enumerate() {
        engine.submit(GenerationRequest {
            request_id: format!("req-{i}"),
            prompt: prompt.clone(),
            sampling: sampling.clone(),
        });
    }
    let mut results = Vec::with_capacity(prompts.len());
    loop {
        let tick = engine.run_tick();
        if tick.is_empty() {
            break;
        }
        debug!(batch = tick.len(), remaining = engine.queue_depth(), "tick");
        results.extend(tick.into_iter().map(|(_, r)| r));
    }
    results
}

/// Run the workload on `config.tensor_parallel_size` in-process ranks and
/// return rank 0's outcome. Every rank must finish with the same token count.
pub fn run_tensor_parallel(
    config: EngineConfig,
    tokenizer: Arc<dyn Tokenizer>,
    vocab_size: usize,
    prompts: &[String],
    sampling: &SamplingConfig,
    mode: Mode,
) -> Result<BenchOutcome> {
    let world_size = config.tensor_parallel_size;
    let ranks = LocalProcessGroup::new(world_size)?;
    info!(world_size, "starting tensor-parallel workers");

    let outcomes = thread::scope(|s| {
        let joins: Vec<_> = ranks
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                let config = config.clone();
                let tokenizer = Arc::clone(&tokenizer);
                s.spawn(move || -> Result<BenchOutcome> {
                    let shard = ShardDescriptor::new(world_size, rank)?;
                    let mut coordinator =
                        ShardCoordinator::new(Arc::new(CpuBackend::new()), shard);
                    let group: Arc<dyn Collective> = Arc::new(handle);
                    coordinator.initialize(Some(group))?;
                    let model = SyntheticModel::new(vocab_size, shard)?;
                    let engine = GenerationOrchestrator::new(
                        model,
                        Box::new(tokenizer),
                        coordinator,
                        config,
                    )?;
                    Ok(run_workload(&engine, prompts, sampling, mode))
                })
            })
            .collect();
        joins
            .into_iter()
            .map(|j| {
                j.join()
                    .map_err(|_| ServeError::Internal("worker rank panicked".into()))?
            })
            .collect::<Result<Vec<_>>>()
    })?;

    let mut outcomes = outcomes.into_iter();
    let first = outcomes
        .next()
        .ok_or_else(|| ServeError::Internal("no ranks ran".into()))?;
    for (rank, other) in outcomes.enumerate() {
        if other.report.total_tokens != first.report.total_tokens {
            return Err(ServeError::Collective(format!(
                "rank {} generated {} tokens, rank 0 generated {}",
                rank + 1,
                other.report.total_tokens,
                first.report.total_tokens
            )));
        }
    }
    Ok(first)
}
