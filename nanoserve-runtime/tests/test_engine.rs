use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nanoserve_backend_cpu::{CpuBackend, CpuTensor};
use nanoserve_core::{
    Backend, DType, EngineConfig, FinishReason, GenerationRequest, KvState, Model, ModelInput,
    ModelOutput, Result, SamplingConfig, SamplingParams, ServeError, ShardDescriptor, Tokenizer,
};
use nanoserve_parallel::{Collective, LocalProcessGroup, ShardCoordinator};
use nanoserve_runtime::{CancelHandle, EngineEvent, GenerationOrchestrator};

const VOCAB: usize = 16;
const EOS: u32 = 0;
const ALPHABET: &str = " abcdefghijklmn";

/// Maps each character of `ALPHABET` to its position + 1; id 0 is EOS.
struct CharTokenizer;

impl Tokenizer for CharTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        text.chars()
            .map(|c| {
                ALPHABET
                    .chars()
                    .position(|a| a == c)
                    .map(|p| p as u32 + 1)
                    .ok_or_else(|| ServeError::Upstream(format!("unknown character {c:?}")))
            })
            .collect()
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        ids.iter()
            .map(|&id| {
                ALPHABET
                    .chars()
                    .nth((id as usize).wrapping_sub(1))
                    .ok_or_else(|| ServeError::Upstream(format!("unknown id {id}")))
            })
            .collect()
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

/// Deterministic stand-in for a language model.
///
/// In peaked mode the next token is `last % 15 + 1`, or EOS right after
/// `eos_after`. In spread mode the logits are a fixed function of the last
/// token with no dominant entry.
#[derive(Clone)]
struct ScriptedModel {
    backend: CpuBackend,
    shard: ShardDescriptor,
    eos_after: Option<u32>,
    fail_at_len: Option<usize>,
    spread: bool,
    max_positions: Option<usize>,
    calls: Arc<AtomicUsize>,
    past_hits: Arc<AtomicUsize>,
}

impl ScriptedModel {
    fn new() -> Self {
        Self {
            backend: CpuBackend::new(),
            shard: ShardDescriptor::single(),
            eos_after: None,
            fail_at_len: None,
            spread: false,
            max_positions: None,
            calls: Arc::new(AtomicUsize::new(0)),
            past_hits: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn full_logits(&self, last: u32) -> Vec<f32> {
        let mut logits = vec![0.0f32; VOCAB];
        if self.spread {
            for (i, l) in logits.iter_mut().enumerate() {
                *l = ((i as u32 * 7 + last * 3) % 11) as f32 / 3.0;
            }
        } else {
            let next = match self.eos_after {
                Some(t) if t == last => EOS,
                _ => last % 15 + 1,
            };
            logits[next as usize] = 10.0;
        }
        logits
    }
}

impl Model for ScriptedModel {
    type T = CpuTensor;

    fn forward(
        &self,
        input: &ModelInput,
        past: Option<&KvState<CpuTensor>>,
    ) -> Result<ModelOutput<CpuTensor>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if past.is_some() {
            self.past_hits.fetch_add(1, Ordering::SeqCst);
        }
        if self.fail_at_len.is_some_and(|limit| input.len() >= limit) {
            return Err(ServeError::Upstream("forward pass failed".into()));
        }
        let last = *input.input_ids.last().unwrap();
        let full = self
            .backend
            .copy_from_host_f32(&self.full_logits(last), &[1, VOCAB])?;
        let per_rank = VOCAB / self.shard.world_size();
        let logits = self
            .backend
            .narrow(&full, 1, self.shard.rank() * per_rank, per_rank)?;

        let kv = CpuTensor::with_dtype(vec![0.0; input.len() * 2], vec![1, input.len(), 2], DType::F16);
        Ok(ModelOutput {
            logits,
            kv_state: Some(KvState {
                key_states: kv.clone(),
                value_states: kv,
            }),
        })
    }

    fn max_position_embeddings(&self) -> Option<usize> {
        self.max_positions
    }
}

fn engine(
    model: ScriptedModel,
    config: EngineConfig,
) -> GenerationOrchestrator<CpuBackend, ScriptedModel> {
    let coordinator = ShardCoordinator::single(Arc::new(CpuBackend::new()));
    GenerationOrchestrator::new(model, Box::new(CharTokenizer), coordinator, config).unwrap()
}

fn request(id: &str, prompt: &str, sampling: SamplingConfig) -> GenerationRequest {
    GenerationRequest {
        request_id: id.to_string(),
        prompt: prompt.to_string(),
        sampling,
    }
}

fn greedy(max_tokens: i64, min_tokens: i64, stops: Vec<Vec<u32>>) -> SamplingConfig {
    SamplingConfig::try_from(SamplingParams {
        temperature: 0.0,
        max_tokens,
        min_tokens,
        stop_sequences: stops,
        ..Default::default()
    })
    .unwrap()
}

#[test]
fn test_greedy_runs_to_max_tokens() {
    let engine = engine(ScriptedModel::new(), EngineConfig::default());
    let out = engine.generate_one(&request("r", "a", greedy(3, 1, vec![]))).unwrap();
    assert_eq!(out.token_ids, vec![3, 4, 5]);
    assert_eq!(out.text, "bcd");
    assert_eq!(out.input_tokens, 1);
    assert_eq!(out.tokens_generated(), 3);
    assert_eq!(out.finish_reason, FinishReason::MaxTokens);
}

#[test]
fn test_stops_on_eos_without_emitting_it() {
    let model = ScriptedModel {
        eos_after: Some(4),
        ..ScriptedModel::new()
    };
    let engine = engine(model, EngineConfig::default());
    let out = engine.generate_one(&request("r", "a", greedy(10, 1, vec![]))).unwrap();
    assert_eq!(out.token_ids, vec![3, 4]);
    assert_eq!(out.text, "bc");
    assert_eq!(out.finish_reason, FinishReason::EosToken);
}

#[test]
fn test_min_tokens_defers_eos() {
    let model = ScriptedModel {
        eos_after: Some(4),
        ..ScriptedModel::new()
    };
    let engine = engine(model, EngineConfig::default());
    let out = engine.generate_one(&request("r", "a", greedy(10, 4, vec![]))).unwrap();
    // EOS is masked at step 3, so the first non-EOS id wins instead.
    assert_eq!(out.token_ids, vec![3, 4, 1, 2, 3, 4]);
    assert_eq!(out.finish_reason, FinishReason::EosToken);
}

#[test]
fn test_stop_sequence_is_kept_in_output() {
    let engine = engine(ScriptedModel::new(), EngineConfig::default());
    let out = engine
        .generate_one(&request("r", "a", greedy(10, 1, vec![vec![4, 5]])))
        .unwrap();
    assert_eq!(out.token_ids, vec![3, 4, 5]);
    assert_eq!(out.finish_reason, FinishReason::StopSequence);
}

#[test]
fn test_repeat_prompt_hits_both_caches() {
    let model = ScriptedModel::new();
    let past_hits = Arc::clone(&model.past_hits);
    let engine = engine(model, EngineConfig::default());
    let req = request("r", "ab", greedy(3, 1, vec![]));

    let first = engine.generate_one(&req).unwrap();
    assert!(!first.prefix_cache_hit);
    assert!(!first.kv_cache_hit);
    assert_eq!(past_hits.load(Ordering::SeqCst), 0);

    let second = engine.generate_one(&req).unwrap();
    assert!(second.prefix_cache_hit);
    assert!(second.kv_cache_hit);
    assert!(past_hits.load(Ordering::SeqCst) > 0);
    assert_eq!(first.token_ids, second.token_ids);

    let stats = engine.cache_stats();
    assert_eq!(stats.prefix_cache.entry_count, 1);
    assert_eq!(stats.prefix_cache.hits, 1);
    assert_eq!(stats.prefix_cache.requests, 2);
    assert_eq!(stats.kv_cache.entry_count, 1);
    // [1, 2, 2] F16 key and value tensors.
    assert_eq!(stats.kv_cache.memory_bytes, 16);
}

#[test]
fn test_prefix_aliasing_across_prompts() {
    let engine = engine(ScriptedModel::new(), EngineConfig::default());
    let shared = "abc ".repeat(25);
    assert_eq!(shared.chars().count(), 100);

    let first = engine
        .generate_one(&request("r1", &format!("{shared}a"), greedy(2, 1, vec![])))
        .unwrap();
    let second = engine
        .generate_one(&request("r2", &format!("{shared}b"), greedy(2, 1, vec![])))
        .unwrap();
    assert!(!first.prefix_cache_hit);
    assert!(second.prefix_cache_hit);
    assert!(!second.kv_cache_hit);
}

#[test]
fn test_cancelled_request_writes_nothing() {
    let model = ScriptedModel::new();
    let calls = Arc::clone(&model.calls);
    let engine = engine(model, EngineConfig::default());
    let cancel = CancelHandle::new();
    cancel.cancel();

    let out = engine
        .generate_one_cancellable(&request("r", "ab", greedy(5, 1, vec![])), &cancel)
        .unwrap();
    assert_eq!(out.finish_reason, FinishReason::Cancelled);
    assert!(out.token_ids.is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stats = engine.cache_stats();
    assert_eq!(stats.prefix_cache.entry_count, 0);
    assert_eq!(stats.kv_cache.entry_count, 0);
}

#[test]
fn test_failures_are_isolated_per_prompt() {
    let engine = engine(ScriptedModel::new(), EngineConfig::default());
    let results = engine.generate(&["ab", "aB", "cd"], &greedy(2, 1, vec![]));
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(matches!(results[1], Err(ServeError::Upstream(_))));
    assert_eq!(results[2].as_ref().unwrap().request_id, "req-2");
    assert_eq!(engine.cache_stats().prefix_cache.entry_count, 2);
}

#[test]
fn test_forward_failure_keeps_earlier_cache_entries() {
    let model = ScriptedModel {
        fail_at_len: Some(5),
        ..ScriptedModel::new()
    };
    let engine = engine(model, EngineConfig::default());
    engine.generate_one(&request("ok", "a", greedy(2, 1, vec![]))).unwrap();

    // Prompt of 4 passes the first forward and fails on the second.
    let err = engine
        .generate_one(&request("bad", "abcd", greedy(4, 1, vec![])))
        .unwrap_err();
    assert!(matches!(err, ServeError::Upstream(_)));

    let stats = engine.cache_stats();
    assert_eq!(stats.prefix_cache.entry_count, 1);
    assert_eq!(stats.kv_cache.entry_count, 1);
}

/// Runtime whose forward pass fails with a shape error.
struct MisshapenModel;

impl Model for MisshapenModel {
    type T = CpuTensor;

    fn forward(
        &self,
        input: &ModelInput,
        _past: Option<&KvState<CpuTensor>>,
    ) -> Result<ModelOutput<CpuTensor>> {
        Err(ServeError::ShapeMismatch {
            expected: vec![1, VOCAB],
            got: vec![input.len()],
        })
    }
}

/// Tokenizer whose vocabulary cannot be read.
struct UnreadableTokenizer;

impl Tokenizer for UnreadableTokenizer {
    fn encode(&self, _text: &str) -> Result<Vec<u32>> {
        Err(std::io::Error::new(std::io::ErrorKind::NotFound, "vocab.json").into())
    }

    fn decode(&self, _ids: &[u32]) -> Result<String> {
        Ok(String::new())
    }

    fn eos_token_id(&self) -> u32 {
        EOS
    }
}

#[test]
fn test_runtime_errors_surface_as_upstream() {
    let coordinator = ShardCoordinator::single(Arc::new(CpuBackend::new()));
    let engine = GenerationOrchestrator::new(
        MisshapenModel,
        Box::new(CharTokenizer),
        coordinator,
        EngineConfig::default(),
    )
    .unwrap();
    let err = engine
        .generate_one(&request("shape", "ab", greedy(2, 1, vec![])))
        .unwrap_err();
    match err {
        ServeError::Upstream(msg) => assert!(msg.contains("Shape mismatch")),
        other => panic!("expected upstream error, got {other:?}"),
    }
    assert_eq!(engine.cache_stats().prefix_cache.entry_count, 0);
}

#[test]
fn test_tokenizer_errors_surface_as_upstream() {
    let coordinator = ShardCoordinator::single(Arc::new(CpuBackend::new()));
    let engine = GenerationOrchestrator::new(
        ScriptedModel::new(),
        Box::new(UnreadableTokenizer),
        coordinator,
        EngineConfig::default(),
    )
    .unwrap();
    let results = engine.generate(&["ab"], &greedy(2, 1, vec![]));
    assert!(matches!(results[0], Err(ServeError::Upstream(_))));
}

#[test]
fn test_prompt_truncated_to_fit_model_len() {
    let config = EngineConfig {
        max_model_len: Some(6),
        ..Default::default()
    };
    let engine = engine(ScriptedModel::new(), config);
    let out = engine
        .generate_one(&request("r", "abcdefghij", greedy(2, 1, vec![])))
        .unwrap();
    assert_eq!(out.input_tokens, 4);
    // Continues from 'd' (id 5), the last kept prompt token.
    assert_eq!(out.token_ids, vec![6, 7]);
}

#[test]
fn test_max_model_len_falls_back_to_model() {
    let model = ScriptedModel {
        max_positions: Some(64),
        ..ScriptedModel::new()
    };
    assert_eq!(engine(model, EngineConfig::default()).max_model_len(), 64);
    assert_eq!(
        engine(ScriptedModel::new(), EngineConfig::default()).max_model_len(),
        2048
    );
}

#[test]
fn test_rejects_mismatched_parallel_config() {
    let config = EngineConfig {
        tensor_parallel_size: 2,
        ..Default::default()
    };
    let coordinator = ShardCoordinator::single(Arc::new(CpuBackend::new()));
    let result = GenerationOrchestrator::new(
        ScriptedModel::new(),
        Box::new(CharTokenizer),
        coordinator,
        config,
    );
    assert!(matches!(result, Err(ServeError::InvalidConfig(_))));
}

#[test]
fn test_run_tick_forms_batch_and_records_throughput() {
    let config = EngineConfig {
        min_batch_size: 1,
        max_batch_size: 4,
        ..Default::default()
    };
    let engine = engine(ScriptedModel::new(), config);
    let handles: Vec<_> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, p)| engine.submit(request(&format!("q{i}"), p, greedy(2, 1, vec![]))))
        .collect();
    assert_eq!(engine.queue_depth(), 3);

    // queue_factor = 3/4 -> batch of 3.
    let results = engine.run_tick();
    assert_eq!(results.len(), 3);
    for ((handle, result), expected) in results.iter().zip(&handles) {
        assert_eq!(handle, expected);
        assert_eq!(result.as_ref().unwrap().tokens_generated(), 2);
    }
    assert_eq!(engine.queue_depth(), 0);
    assert_eq!(engine.cache_stats().batching.total_batches, 1);
    assert!(engine.run_tick().is_empty());
}

#[test]
fn test_cancel_queued_request() {
    let engine = engine(ScriptedModel::new(), EngineConfig::default());
    let a = engine.submit(request("a", "a", greedy(1, 1, vec![])));
    let b = engine.submit(request("b", "b", greedy(1, 1, vec![])));
    engine.cancel_queued(a.seq_id).unwrap();
    assert!(engine.cancel_queued(a.seq_id).is_err());

    let results = engine.run_tick();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, b);
}

#[test]
fn test_memory_fraction_tracks_kv_budget() {
    let config = EngineConfig {
        kv_cache_memory_budget_bytes: Some(1000),
        ..Default::default()
    };
    let engine = engine(ScriptedModel::new(), config);
    assert_eq!(engine.available_memory_fraction(), 1.0);
    engine.generate_one(&request("r", "ab", greedy(1, 1, vec![]))).unwrap();
    let fraction = engine.available_memory_fraction();
    assert!((fraction - 0.984).abs() < 1e-9);

    engine.clear_caches();
    assert_eq!(engine.available_memory_fraction(), 1.0);
}

#[tokio::test]
async fn test_stream_emits_tokens_then_finish() {
    let engine = Arc::new(engine(ScriptedModel::new(), EngineConfig::default()));
    let mut rx = engine.stream(request("s", "a", greedy(3, 1, vec![])));

    let mut tokens = Vec::new();
    let mut finish = None;
    while let Some(event) = rx.recv().await {
        match event {
            EngineEvent::Token {
                request_id,
                token_id,
                text,
            } => {
                assert_eq!(request_id, "s");
                assert!(text.is_some());
                tokens.push(token_id);
            }
            EngineEvent::Finish { reason, output, .. } => {
                assert_eq!(output.token_ids, tokens);
                finish = Some(reason);
            }
            EngineEvent::Error { error, .. } => panic!("unexpected error: {error}"),
        }
    }
    assert_eq!(tokens, vec![3, 4, 5]);
    assert_eq!(finish, Some(FinishReason::MaxTokens));
}

#[tokio::test]
async fn test_stream_reports_errors() {
    let engine = Arc::new(engine(ScriptedModel::new(), EngineConfig::default()));
    let mut rx = engine.stream(request("s", "ABC", greedy(3, 1, vec![])));
    match rx.recv().await {
        Some(EngineEvent::Error { request_id, .. }) => assert_eq!(request_id, "s"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_dropping_stream_receiver_cancels() {
    let model = ScriptedModel::new();
    let calls = Arc::clone(&model.calls);
    let engine = Arc::new(engine(model, EngineConfig::default()));
    let mut rx = engine.stream(request("s", "a", greedy(1_000_000, 1, vec![])));
    assert!(matches!(rx.recv().await, Some(EngineEvent::Token { .. })));
    drop(rx);

    let mut last = calls.load(Ordering::SeqCst);
    let mut stable = false;
    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let now = calls.load(Ordering::SeqCst);
        if now == last {
            stable = true;
            break;
        }
        last = now;
    }
    assert!(stable, "generation kept running after the receiver was dropped");
    assert_eq!(engine.cache_stats().prefix_cache.entry_count, 0);
}

fn run_parallel(
    world_size: usize,
    model: ScriptedModel,
    sampling: SamplingConfig,
) -> Vec<Vec<u32>> {
    let ranks = LocalProcessGroup::new(world_size).unwrap();
    std::thread::scope(|s| {
        let joins: Vec<_> = ranks
            .into_iter()
            .map(|handle| {
                let model = model.clone();
                let sampling = sampling.clone();
                s.spawn(move || {
                    let shard = ShardDescriptor::new(world_size, handle.rank()).unwrap();
                    let mut coordinator = ShardCoordinator::new(Arc::new(CpuBackend::new()), shard);
                    let group: Arc<dyn Collective> = Arc::new(handle);
                    coordinator.initialize(Some(group)).unwrap();
                    let config = EngineConfig {
                        tensor_parallel_size: world_size,
                        ..Default::default()
                    };
                    let model = ScriptedModel { shard, ..model };
                    let engine =
                        GenerationOrchestrator::new(model, Box::new(CharTokenizer), coordinator, config)
                            .unwrap();
                    engine
                        .generate_one(&request("tp", "abc", sampling))
                        .unwrap()
                        .token_ids
                })
            })
            .collect();
        joins.into_iter().map(|j| j.join().unwrap()).collect()
    })
}

#[test]
fn test_tensor_parallel_matches_single_worker() {
    let model = ScriptedModel {
        spread: true,
        ..ScriptedModel::new()
    };
    let sampling = SamplingConfig::try_from(SamplingParams {
        temperature: 0.9,
        top_k: 0,
        min_tokens: 8,
        max_tokens: 8,
        seed: Some(11),
        ..Default::default()
    })
    .unwrap();

    let single = engine(model.clone(), EngineConfig::default())
        .generate_one(&request("tp", "abc", sampling.clone()))
        .unwrap()
        .token_ids;
    assert_eq!(single.len(), 8);

    for tokens in run_parallel(2, model, sampling) {
        assert_eq!(tokens, single);
    }
}

#[test]
fn test_tensor_parallel_ranks_agree_without_seed() {
    let model = ScriptedModel {
        spread: true,
        ..ScriptedModel::new()
    };
    let sampling = SamplingConfig::try_from(SamplingParams {
        top_k: 0,
        min_tokens: 6,
        max_tokens: 6,
        ..Default::default()
    })
    .unwrap();
    let results = run_parallel(4, model, sampling);
    assert!(results.iter().all(|tokens| tokens == &results[0]));
}
