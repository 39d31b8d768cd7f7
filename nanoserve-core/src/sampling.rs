use serde::{Deserialize, Serialize};

use crate::{Result, ServeError};

/// Raw, unvalidated sampling parameters as they arrive from a request.
///
/// Signed integer fields keep out-of-range values representable so that
/// validation can reject them; see [`SamplingConfig::try_from`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_k: i64,
    pub top_p: f32,
    pub max_tokens: i64,
    pub min_tokens: i64,
    pub repetition_penalty: f32,
    pub stop_sequences: Vec<Vec<u32>>,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_k: 50,
            top_p: 1.0,
            max_tokens: 256,
            min_tokens: 1,
            repetition_penalty: 1.0,
            stop_sequences: Vec::new(),
            seed: None,
        }
    }
}

/// Validated, immutable sampling configuration for one request.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingConfig {
    temperature: f32,
    top_k: usize,
    top_p: f32,
    max_tokens: usize,
    min_tokens: usize,
    repetition_penalty: f32,
    stop_sequences: Vec<Vec<u32>>,
    seed: Option<u64>,
}

impl TryFrom<SamplingParams> for SamplingConfig {
    type Error = ServeError;

    fn try_from(p: SamplingParams) -> Result<Self> {
        if p.temperature.is_nan() || p.temperature < 0.0 {
            return Err(ServeError::InvalidConfig(format!(
                "temperature must be non-negative, got {}",
                p.temperature
            )));
        }
        if p.top_k < 0 {
            return Err(ServeError::InvalidConfig(format!(
                "top_k must be non-negative, got {}",
                p.top_k
            )));
        }
        if !(0.0..=1.0).contains(&p.top_p) {
            return Err(ServeError::InvalidConfig(format!(
                "top_p must be between 0 and 1, got {}",
                p.top_p
            )));
        }
        if p.max_tokens <= 0 {
            return Err(ServeError::InvalidConfig(format!(
                "max_tokens must be positive, got {}",
                p.max_tokens
            )));
        }
        if p.min_tokens < 0 {
            return Err(ServeError::InvalidConfig(format!(
                "min_tokens must be non-negative, got {}",
                p.min_tokens
            )));
        }
        if p.repetition_penalty.is_nan() || p.repetition_penalty < 0.0 {
            return Err(ServeError::InvalidConfig(format!(
                "repetition_penalty must be non-negative, got {}",
                p.repetition_penalty
            )));
        }

        Ok(Self {
            temperature: p.temperature,
            top_k: p.top_k as usize,
            top_p: p.top_p,
            max_tokens: p.max_tokens as usize,
            min_tokens: p.min_tokens as usize,
            repetition_penalty: p.repetition_penalty,
            stop_sequences: p
                .stop_sequences
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect(),
            seed: p.seed,
        })
    }
}

impl SamplingConfig {
    /// Greedy decoding: temperature 0.
    pub fn greedy(max_tokens: usize) -> Result<Self> {
        Self::try_from(SamplingParams {
            temperature: 0.0,
            max_tokens: max_tokens as i64,
            ..Default::default()
        })
    }

    pub fn creative(max_tokens: usize) -> Result<Self> {
        Self::try_from(SamplingParams {
            temperature: 0.8,
            top_k: 40,
            top_p: 0.9,
            max_tokens: max_tokens as i64,
            ..Default::default()
        })
    }

    pub fn balanced(max_tokens: usize) -> Result<Self> {
        Self::try_from(SamplingParams {
            temperature: 0.6,
            top_k: 50,
            top_p: 0.95,
            max_tokens: max_tokens as i64,
            ..Default::default()
        })
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    /// `0` disables top-k filtering.
    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn max_tokens(&self) -> usize {
        self.max_tokens
    }

    pub fn min_tokens(&self) -> usize {
        self.min_tokens
    }

    pub fn repetition_penalty(&self) -> f32 {
        self.repetition_penalty
    }

    pub fn stop_sequences(&self) -> &[Vec<u32>] {
        &self.stop_sequences
    }

    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    /// Back to the raw form, e.g. for serializing a request.
    pub fn to_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_k: self.top_k as i64,
            top_p: self.top_p,
            max_tokens: self.max_tokens as i64,
            min_tokens: self.min_tokens as i64,
            repetition_penalty: self.repetition_penalty,
            stop_sequences: self.stop_sequences.clone(),
            seed: self.seed,
        }
    }
}

pub struct SampleResult {
    pub token_id: u32,
    pub logprob: f32,
}
