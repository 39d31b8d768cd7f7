//! Deterministic stand-in for a language model.
//!
//! Logits are a hash of the last few context tokens and the candidate id, so
//! a given context always produces the same distribution on every rank and
//! every run. With tensor parallelism each rank computes only its slice of
//! the vocabulary; the vocabulary is padded up to a multiple of the world
//! size and padding ids get `-inf`.

use half::f16;
use nanoserve_backend_cpu::{CpuBackend, CpuTensor};
use nanoserve_core::{
    Backend, KvState, Model, ModelInput, ModelOutput, Result, ServeError, ShardDescriptor,
};

const CONTEXT_WINDOW: usize = 4;
const LOGIT_SCALE: f32 = 6.0;

#[derive(Debug, Clone)]
pub struct SyntheticModel {
    backend: CpuBackend,
    shard: ShardDescriptor,
    vocab_size: usize,
    num_layers: usize,
    kv_width: usize,
    max_positions: usize,
}

impl SyntheticModel {
    pub fn new(vocab_size: usize, shard: ShardDescriptor) -> Result<Self> {
        if vocab_size == 0 {
            return Err(ServeError::InvalidConfig(
                "vocab_size must be positive".into(),
            ));
        }
        Ok(Self {
            backend: CpuBackend::new(),
            shard,
            vocab_size,
            num_layers: 2,
            kv_width: 16,
            max_positions: 4096,
        })
    }

    /// Shape of the simulated KV states: `[num_layers, seq_len, kv_width]`.
    pub fn with_kv_shape(mut self, num_layers: usize, kv_width: usize) -> Self {
        self.num_layers = num_layers;
        self.kv_width = kv_width;
        self
    }

    pub fn with_max_positions(mut self, max_positions: usize) -> Self {
        self.max_positions = max_positions;
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    /// Vocabulary rounded up to a multiple of the world size.
    pub fn padded_vocab_size(&self) -> usize {
        self.vocab_size.div_ceil(self.shard.world_size()) * self.shard.world_size()
    }

    /// Logits for token ids `start..start + len` after `context`.
    pub fn logits_range(&self, context: &[u32], start: usize, len: usize) -> Vec<f32> {
        let tail = &context[context.len().saturating_sub(CONTEXT_WINDOW)..];
        let seed = tail
            .iter()
            .fold(0x9e37_79b9_7f4a_7c15u64, |h, &t| mix(h ^ u64::from(t)));
        (start..start + len)
            .map(|id| {
                if id >= self.vocab_size {
                    f32::NEG_INFINITY
                } else {
                    let h = mix(seed ^ (id as u64).wrapping_mul(0xff51_afd7_ed55_8ccd));
                    (h >> 40) as f32 / (1u64 << 24) as f32 * LOGIT_SCALE
                }
            })
            .collect()
    }
}

/// splitmix64 finalizer.
fn mix(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9e37_79b9_7f4a_7c15);
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

impl Model for SyntheticModel {
    type T = CpuTensor;

    fn forward(
        &self,
        input: &ModelInput,
        _past: Option<&KvState<CpuTensor>>,
    ) -> Result<ModelOutput<CpuTensor>> {
        let seq_len = input
            .attention_mask
            .iter()
            .take_while(|&&m| m == 1)
            .count();
        if seq_len == 0 {
            return Err(ServeError::InvalidArgument("empty model input".into()));
        }
        let context = &input.input_ids[..seq_len];

        let per_rank = self.padded_vocab_size() / self.shard.world_size();
        let logits = self.logits_range(context, self.shard.rank() * per_rank, per_rank);
        let logits = self.backend.copy_from_host_f32(&logits, &[1, per_rank])?;

        let kv_shape = [self.num_layers, seq_len, self.kv_width];
        let kv = self
            .backend
            .copy_from_host_f16(&vec![f16::ZERO; kv_shape.iter().product()], &kv_shape)?;
        Ok(ModelOutput {
            logits,
            kv_state: Some(KvState {
                key_states: kv.clone(),
                value_states: kv,
            }),
        })
    }

    fn max_position_embeddings(&self) -> Option<usize> {
        Some(self.max_positions)
    }
}
