use crate::tensor::Tensor;
use crate::Result;

/// Input for one forward pass over a single sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInput {
    pub input_ids: Vec<u32>,
    /// 1 for real tokens, 0 for padding; same length as `input_ids`.
    pub attention_mask: Vec<u32>,
}

impl ModelInput {
    pub fn new(input_ids: Vec<u32>) -> Self {
        let attention_mask = vec![1; input_ids.len()];
        Self {
            input_ids,
            attention_mask,
        }
    }

    /// Right-pad to `len` tokens with `pad_token_id`, masking the padding.
    pub fn padded(input_ids: &[u32], len: usize, pad_token_id: u32) -> Self {
        let mut ids = input_ids.to_vec();
        let mut mask = vec![1; ids.len()];
        if ids.len() < len {
            ids.resize(len, pad_token_id);
            mask.resize(len, 0);
        }
        Self {
            input_ids: ids,
            attention_mask: mask,
        }
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// Attention key/value states for a processed token sequence.
#[derive(Debug, Clone)]
pub struct KvState<T: Tensor> {
    pub key_states: T,
    pub value_states: T,
}

impl<T: Tensor> KvState<T> {
    pub fn size_bytes(&self) -> usize {
        self.key_states.size_bytes() + self.value_states.size_bytes()
    }
}

pub struct ModelOutput<T: Tensor> {
    /// Logits for the last position, shape [1, vocab]. With tensor
    /// parallelism each rank returns its own vocab shard.
    pub logits: T,
    /// KV states for the whole input, when the runtime exposes them.
    pub kv_state: Option<KvState<T>>,
}

/// The external model runtime.
pub trait Model: Send + Sync {
    type T: Tensor;

    /// Run the model over `input` and return logits for its last position.
    ///
    /// `past` carries KV states previously produced for a prefix of `input`
    /// that the runtime may reuse instead of recomputing.
    fn forward(
        &self,
        input: &ModelInput,
        past: Option<&KvState<Self::T>>,
    ) -> Result<ModelOutput<Self::T>>;

    fn max_position_embeddings(&self) -> Option<usize> {
        None
    }
}
