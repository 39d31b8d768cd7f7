//! Generation orchestrator: the per-request loop that ties the caches, the
//! external model, tensor-parallel gathering and sampling together, plus the
//! batch tick driven by the scheduler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use nanoserve_core::config::DEFAULT_MAX_MODEL_LEN;
use nanoserve_core::{
    Backend, EngineConfig, FinishReason, GenerationOutput, GenerationRequest, KvState, Model,
    ModelInput, RequestHandle, Result, SamplingConfig, ServeError, Tensor, Tokenizer,
};
use nanoserve_kvcache::{CacheStats, KvCache, PrefixCache};
use nanoserve_parallel::ShardCoordinator;
use nanoserve_scheduler::{BatchScheduler, BatchStats};

use crate::sampling::{LogitProcessorPipeline, TokenSampler};
use crate::stop::StopChecker;

/// Events emitted while streaming one request.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    Token {
        request_id: String,
        token_id: u32,
        text: Option<String>,
    },
    Finish {
        request_id: String,
        reason: FinishReason,
        output: GenerationOutput,
    },
    Error {
        request_id: String,
        error: String,
    },
}

/// Cooperative cancellation flag, checked once per generated token.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineStats {
    pub kv_cache: CacheStats,
    pub prefix_cache: CacheStats,
    pub batching: BatchStats,
}

/// Runs generation requests against a model.
///
/// With tensor parallelism every rank owns one orchestrator and must submit
/// the same requests in the same order; the sampled token is taken from
/// rank 0 so all ranks stay in lockstep. Cancellation must likewise be
/// requested on every rank.
pub struct GenerationOrchestrator<B: Backend, M: Model<T = B::Tensor>> {
    model: M,
    tokenizer: Box<dyn Tokenizer>,
    coordinator: ShardCoordinator<B>,
    kv_cache: KvCache<B::Tensor>,
    prefix_cache: PrefixCache,
    scheduler: Mutex<BatchScheduler>,
    sampler: TokenSampler,
    config: EngineConfig,
    max_model_len: usize,
}

impl<B: Backend, M: Model<T = B::Tensor>> GenerationOrchestrator<B, M> {
    pub fn new(
        model: M,
        tokenizer: Box<dyn Tokenizer>,
        coordinator: ShardCoordinator<B>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        if !coordinator.is_initialized() {
            return Err(ServeError::InvalidConfig(
                "shard coordinator must be initialized".into(),
            ));
        }
        if coordinator.world_size() != config.tensor_parallel_size {
            return Err(ServeError::InvalidConfig(format!(
                "tensor_parallel_size {} does not match coordinator world size {}",
                config.tensor_parallel_size,
                coordinator.world_size()
            )));
        }

        let max_model_len = config
            .max_model_len
            .or_else(|| model.max_position_embeddings())
            .unwrap_or(DEFAULT_MAX_MODEL_LEN);
        info!(
            backend = coordinator.backend().name(),
            rank = coordinator.rank(),
            world_size = coordinator.world_size(),
            max_model_len,
            "generation orchestrator ready"
        );

        Ok(Self {
            kv_cache: KvCache::new(config.kv_cache_capacity)?,
            prefix_cache: PrefixCache::with_prefix_chars(
                config.prefix_cache_capacity,
                config.prefix_chars,
            )?,
            scheduler: Mutex::new(BatchScheduler::from_config(&config)?),
            model,
            tokenizer,
            coordinator,
            sampler: TokenSampler,
            config,
            max_model_len,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn max_model_len(&self) -> usize {
        self.max_model_len
    }

    pub fn coordinator(&self) -> &ShardCoordinator<B> {
        &self.coordinator
    }

    pub fn kv_cache(&self) -> &KvCache<B::Tensor> {
        &self.kv_cache
    }

    pub fn prefix_cache(&self) -> &PrefixCache {
        &self.prefix_cache
    }

    // ── Single requests ────────────────────────────────────────

    pub fn generate_one(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        self.run_request(request, &CancelHandle::new(), |_| true)
    }

    /// Like [`generate_one`](Self::generate_one), stopping with
    /// [`FinishReason::Cancelled`] once `cancel` is set.
    pub fn generate_one_cancellable(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<GenerationOutput> {
        self.run_request(request, cancel, |_| true)
    }

    /// Generate for each prompt in turn. A failure affects only its own
    /// entry; request ids are `req-{index}`.
    pub fn generate<S: AsRef<str>>(
        &self,
        prompts: &[S],
        sampling: &SamplingConfig,
    ) -> Vec<Result<GenerationOutput>> {
        info!(prompts = prompts.len(), "generating");
        let start = Instant::now();
        let results: Vec<_> = prompts
            .iter()
            .enumerate()
            .map(|(i, prompt)| {
                let request = GenerationRequest {
                    request_id: format!("req-{i}"),
                    prompt: prompt.as_ref().to_string(),
                    sampling: sampling.clone(),
                };
                self.generate_logged(&request)
            })
            .collect();

        let tokens = total_tokens(results.iter().map(Result::as_ref));
        let elapsed = start.elapsed().as_secs_f64();
        info!(
            tokens,
            elapsed_s = elapsed,
            throughput = throughput(tokens, elapsed),
            "generation complete"
        );
        results
    }

    fn generate_logged(&self, request: &GenerationRequest) -> Result<GenerationOutput> {
        let result = self.generate_one(request);
        if let Err(e) = &result {
            error!(request_id = %request.request_id, error = %e, "generation failed");
        }
        result
    }

    /// The per-request loop. `on_token` sees every emitted token and returns
    /// `false` to cancel.
    fn run_request<F>(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
        mut on_token: F,
    ) -> Result<GenerationOutput>
    where
        F: FnMut(u32) -> bool,
    {
        let sampling = &request.sampling;

        let prefix_key = self.prefix_cache.derive_key(&request.prompt);
        let prefix_cache_hit = self.prefix_cache.get(&prefix_key).is_some();
        if prefix_cache_hit {
            debug!(request_id = %request.request_id, "prefix cache hit");
        }

        let mut prompt_ids = self.tokenizer.encode(&request.prompt).map_err(upstream)?;
        if prompt_ids.is_empty() {
            return Err(ServeError::InvalidArgument(
                "prompt encodes to no tokens".into(),
            ));
        }
        let prompt_budget = self
            .max_model_len
            .saturating_sub(sampling.max_tokens())
            .max(1);
        if prompt_ids.len() > prompt_budget {
            debug!(
                request_id = %request.request_id,
                from = prompt_ids.len(),
                to = prompt_budget,
                "truncating prompt"
            );
            prompt_ids.truncate(prompt_budget);
        }
        let input_tokens = prompt_ids.len();

        let kv_key = KvCache::<B::Tensor>::derive_key(&prompt_ids);
        let past = self.kv_cache.get(&kv_key);
        let kv_cache_hit = past.is_some();
        let mut fresh_kv: Option<KvState<B::Tensor>> = None;

        let eos_token_id = self.tokenizer.eos_token_id();
        let pipeline = LogitProcessorPipeline::from_config(sampling, eos_token_id);
        let stop = StopChecker::new(sampling, eos_token_id);

        let mut input = ModelInput::new(prompt_ids);
        let mut generated: Vec<u32> = Vec::with_capacity(sampling.max_tokens());

        let finish_reason = loop {
            if cancel.is_cancelled() {
                break FinishReason::Cancelled;
            }

            let output = self
                .model
                .forward(&input, past.as_ref())
                .map_err(upstream)?;
            let mut logits = self.last_position_logits(&output.logits)?;
            if generated.is_empty() && !kv_cache_hit {
                fresh_kv = output.kv_state;
            }

            pipeline.apply(&mut logits, &generated);
            let sampled = self.sampler.sample(&logits, sampling, generated.len())?;
            let token_id = self.coordinator.broadcast_u32(sampled.token_id)?;

            if stop.is_eos(token_id) {
                break FinishReason::EosToken;
            }
            generated.push(token_id);
            input.input_ids.push(token_id);
            input.attention_mask.push(1);

            if !on_token(token_id) {
                break FinishReason::Cancelled;
            }
            if let Some(reason) = stop.check(&generated) {
                break reason;
            }
        };

        let text = self.tokenizer.decode(&generated).map_err(upstream)?;

        if finish_reason == FinishReason::Cancelled {
            debug!(request_id = %request.request_id, "request cancelled");
        } else {
            self.prefix_cache.put(prefix_key, &generated);
            if let Some(kv) = fresh_kv {
                self.kv_cache.put(kv_key, &kv.key_states, &kv.value_states);
            }
        }

        Ok(GenerationOutput {
            request_id: request.request_id.clone(),
            text,
            token_ids: generated,
            input_tokens,
            finish_reason,
            prefix_cache_hit,
            kv_cache_hit,
        })
    }

    /// Full-vocabulary logits of the last position, on the host.
    fn last_position_logits(&self, logits: &B::Tensor) -> Result<Vec<f32>> {
        let full = self.coordinator.all_gather(logits)?;
        let vocab = full
            .shape()
            .last()
            .copied()
            .filter(|&v| v > 0)
            .ok_or_else(|| ServeError::Upstream("model returned empty logits".into()))?;

        let backend = self.coordinator.backend();
        backend.synchronize()?;
        let mut host = backend.copy_to_host_f32(&full)?;
        if host.len() < vocab {
            return Err(ServeError::ShapeMismatch {
                expected: full.shape().to_vec(),
                got: vec![host.len()],
            });
        }
        Ok(host.split_off(host.len() - vocab))
    }

    // ── Streaming ──────────────────────────────────────────────

    /// Run `request` on a blocking task and stream its events. Dropping the
    /// receiver cancels the request.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn stream(self: &Arc<Self>, request: GenerationRequest) -> mpsc::Receiver<EngineEvent>
    where
        M: 'static,
    {
        let (event_tx, event_rx) = mpsc::channel(256);
        let engine = Arc::clone(self);
        tokio::task::spawn_blocking(move || engine.stream_blocking(&request, &event_tx));
        event_rx
    }

    fn stream_blocking(&self, request: &GenerationRequest, event_tx: &mpsc::Sender<EngineEvent>) {
        let request_id = &request.request_id;
        let result = self.run_request(request, &CancelHandle::new(), |token_id| {
            let text = self.tokenizer.decode(&[token_id]).ok();
            event_tx
                .blocking_send(EngineEvent::Token {
                    request_id: request_id.clone(),
                    token_id,
                    text,
                })
                .is_ok()
        });

        let event = match result {
            Ok(output) => EngineEvent::Finish {
                request_id: request_id.clone(),
                reason: output.finish_reason,
                output,
            },
            Err(e) => {
                error!(request_id = %request_id, error = %e, "streamed generation failed");
                EngineEvent::Error {
                    request_id: request_id.clone(),
                    error: e.to_string(),
                }
            }
        };
        // The receiver may already be gone.
        let _ = event_tx.blocking_send(event);
    }

    // ── Scheduled batches ──────────────────────────────────────

    fn scheduler(&self) -> MutexGuard<'_, BatchScheduler> {
        self.scheduler.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a request for [`run_tick`](Self::run_tick).
    pub fn submit(&self, request: GenerationRequest) -> RequestHandle {
        self.scheduler().enqueue(request)
    }

    pub fn cancel_queued(&self, seq_id: u64) -> Result<()> {
        self.scheduler().cancel(seq_id)
    }

    pub fn queue_depth(&self) -> usize {
        self.scheduler().queue_depth()
    }

    /// Share of the KV cache memory budget still free; 1 without a budget.
    pub fn available_memory_fraction(&self) -> f64 {
        match self.config.kv_cache_memory_budget_bytes {
            Some(budget) if budget > 0 => {
                let used = self.kv_cache.memory_bytes() as f64;
                (1.0 - used / budget as f64).clamp(0.0, 1.0)
            }
            _ => 1.0,
        }
    }

    /// Form one batch from the queue, run it, and feed its throughput back
    /// into the batch controller. Returns nothing when the queue is empty.
    pub fn run_tick(&self) -> Vec<(RequestHandle, Result<GenerationOutput>)> {
        let fraction = self.available_memory_fraction();
        let batch = self.scheduler().next_batch(fraction);
        if batch.is_empty() {
            return Vec::new();
        }

        let start = Instant::now();
        let results: Vec<_> = batch
            .into_iter()
            .map(|seq| (seq.handle(), self.generate_logged(&seq.request)))
            .collect();
        let tokens = total_tokens(results.iter().map(|(_, r)| r.as_ref()));
        let elapsed = start.elapsed().as_secs_f64();
        let rate = throughput(tokens, elapsed);

        self.scheduler().record(results.len(), rate);
        debug!(
            batch_size = results.len(),
            tokens,
            throughput = rate,
            memory_fraction = fraction,
            "tick complete"
        );
        results
    }

    // ── Cache maintenance ──────────────────────────────────────

    pub fn cache_stats(&self) -> EngineStats {
        EngineStats {
            kv_cache: self.kv_cache.stats(),
            prefix_cache: self.prefix_cache.stats(),
            batching: self.scheduler().batch_stats(),
        }
    }

    pub fn clear_caches(&self) {
        self.kv_cache.clear();
        self.prefix_cache.clear();
    }

    /// Prune both caches; returns the entries removed from (kv, prefix).
    pub fn prune_caches(&self) -> (usize, usize) {
        (self.kv_cache.prune(), self.prefix_cache.prune())
    }
}

/// Failures of the model or tokenizer reach callers as `Upstream`.
fn upstream(e: ServeError) -> ServeError {
    match e {
        ServeError::Upstream(_) => e,
        other => ServeError::Upstream(other.to_string()),
    }
}

fn total_tokens<'a>(
    results: impl Iterator<Item = std::result::Result<&'a GenerationOutput, &'a ServeError>>,
) -> usize {
    results.filter_map(|r| r.ok()).map(|o| o.tokens_generated()).sum()
}

fn throughput(tokens: usize, elapsed_secs: f64) -> f64 {
    if elapsed_secs > 0.0 {
        tokens as f64 / elapsed_secs
    } else {
        0.0
    }
}
