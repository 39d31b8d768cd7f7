use crate::{FinishReason, SamplingConfig};

#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: String,
    pub sampling: SamplingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestHandle {
    pub request_id: String,
    pub seq_id: u64,
}

#[derive(Debug, Clone)]
pub struct GenerationOutput {
    pub request_id: String,
    pub text: String,
    pub token_ids: Vec<u32>,
    pub input_tokens: usize,
    pub finish_reason: FinishReason,
    /// The prompt's leading characters matched an earlier completion.
    pub prefix_cache_hit: bool,
    /// The prompt's KV states were reused.
    pub kv_cache_hit: bool,
}

impl GenerationOutput {
    pub fn tokens_generated(&self) -> usize {
        self.token_ids.len()
    }
}
