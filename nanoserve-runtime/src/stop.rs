use nanoserve_core::{FinishReason, SamplingConfig};

/// Termination rules for one request.
///
/// End-of-sequence is checked on the sampled token before it is appended;
/// it never becomes part of the output. Stop sequences and the token limit
/// are checked on the output after each append. Stop sequences only count
/// once `min_tokens` tokens exist, and a matched sequence stays in the output.
#[derive(Debug, Clone)]
pub struct StopChecker {
    eos_token_id: u32,
    stop_sequences: Vec<Vec<u32>>,
    min_tokens: usize,
    max_tokens: usize,
}

impl StopChecker {
    pub fn new(config: &SamplingConfig, eos_token_id: u32) -> Self {
        Self {
            eos_token_id,
            stop_sequences: config.stop_sequences().to_vec(),
            min_tokens: config.min_tokens(),
            max_tokens: config.max_tokens(),
        }
    }

    pub fn is_eos(&self, token_id: u32) -> bool {
        token_id == self.eos_token_id
    }

    /// Reason to stop after `generated` was extended, if any.
    pub fn check(&self, generated: &[u32]) -> Option<FinishReason> {
        if generated.len() >= self.min_tokens
            && self
                .stop_sequences
                .iter()
                .any(|seq| generated.ends_with(seq))
        {
            return Some(FinishReason::StopSequence);
        }
        if generated.len() >= self.max_tokens {
            return Some(FinishReason::MaxTokens);
        }
        None
    }
}
