use std::cmp::Ordering;
use std::collections::HashSet;

use nanoserve_core::{Result, SampleResult, SamplingConfig, ServeError};

/// Request-dependent logit adjustments, applied by the caller before
/// [`TokenSampler::sample`] sees the row.
pub struct LogitProcessorPipeline {
    repetition_penalty: f32,
    min_tokens: usize,
    eos_token_id: u32,
}

impl LogitProcessorPipeline {
    pub fn from_config(config: &SamplingConfig, eos_token_id: u32) -> Self {
        Self {
            repetition_penalty: config.repetition_penalty(),
            min_tokens: config.min_tokens(),
            eos_token_id,
        }
    }

    /// Apply all processors in order. Modifies `logits` in place.
    pub fn apply(&self, logits: &mut [f32], generated_tokens: &[u32]) {
        self.apply_repetition_penalty(logits, generated_tokens);
        self.suppress_early_eos(logits, generated_tokens.len());
    }

    fn apply_repetition_penalty(&self, logits: &mut [f32], generated_tokens: &[u32]) {
        if (self.repetition_penalty - 1.0).abs() < f32::EPSILON {
            return;
        }
        // Each distinct token is penalized once, however often it repeats.
        let mut seen = HashSet::new();
        for &token_id in generated_tokens {
            if !seen.insert(token_id) {
                continue;
            }
            if let Some(l) = logits.get_mut(token_id as usize) {
                *l = penalize(*l, self.repetition_penalty);
            }
        }
    }

    /// Mask end-of-sequence until `min_tokens` tokens exist, unless it is
    /// the only token left with a finite logit.
    fn suppress_early_eos(&self, logits: &mut [f32], generated: usize) {
        if generated >= self.min_tokens {
            return;
        }
        let eos = self.eos_token_id as usize;
        if eos >= logits.len() {
            return;
        }
        let has_alternative = logits
            .iter()
            .enumerate()
            .any(|(i, l)| i != eos && l.is_finite());
        if has_alternative {
            logits[eos] = f32::NEG_INFINITY;
        }
    }
}

/// Penalize one logit. A zero penalty pushes positive logits to the largest
/// finite value; results never overflow to `+inf` or become NaN.
fn penalize(logit: f32, penalty: f32) -> f32 {
    if logit > 0.0 {
        if penalty > 0.0 {
            (logit / penalty).min(f32::MAX)
        } else {
            f32::MAX
        }
    } else if logit < 0.0 && logit.is_finite() {
        logit * penalty
    } else {
        logit
    }
}

/// Turns one row of logits into a token id.
///
/// Greedy when `temperature == 0`. Otherwise temperature scaling, top-k and
/// top-p masking all happen in the logit domain, followed by one softmax and
/// a multinomial draw.
pub struct TokenSampler;

impl TokenSampler {
    /// `step` is mixed into a seeded RNG so successive steps of one request
    /// draw differently while staying reproducible.
    pub fn sample(
        &self,
        logits: &[f32],
        config: &SamplingConfig,
        step: usize,
    ) -> Result<SampleResult> {
        if logits.is_empty() {
            return Err(ServeError::InvalidArgument("empty logits".into()));
        }
        if config.temperature() == 0.0 {
            return greedy(logits);
        }

        let temperature = config.temperature();
        let mut scaled: Vec<f32> = logits
            .iter()
            .map(|&l| {
                if l.is_nan() {
                    f32::NEG_INFINITY
                } else {
                    // Tiny temperatures overflow; keep the scaled row finite.
                    (l / temperature).min(f32::MAX)
                }
            })
            .collect();
        if !scaled.iter().any(|l| l.is_finite()) {
            return greedy(logits);
        }

        if config.top_k() > 0 {
            apply_top_k(&mut scaled, config.top_k());
        }
        if config.top_p() < 1.0 {
            apply_top_p(&mut scaled, config.top_p());
        }

        let probs = softmax(&scaled);
        multinomial(&probs, config.seed(), step)
    }
}

/// First index of the largest non-NaN logit.
fn argmax(logits: &[f32]) -> Option<usize> {
    let mut best: Option<(usize, f32)> = None;
    for (i, &l) in logits.iter().enumerate() {
        if l.is_nan() {
            continue;
        }
        match best {
            Some((_, b)) if l <= b => {}
            _ => best = Some((i, l)),
        }
    }
    best.map(|(i, _)| i)
}

fn greedy(logits: &[f32]) -> Result<SampleResult> {
    let token_id = argmax(logits)
        .ok_or_else(|| ServeError::InvalidArgument("logits are all NaN".into()))?;
    let sanitized: Vec<f32> = logits
        .iter()
        .map(|&l| if l.is_nan() { f32::NEG_INFINITY } else { l })
        .collect();
    let p = softmax(&sanitized)[token_id];
    Ok(SampleResult {
        token_id: token_id as u32,
        logprob: ln_or_neg_inf(p),
    })
}

fn ln_or_neg_inf(p: f32) -> f32 {
    if p > 0.0 {
        p.ln()
    } else {
        f32::NEG_INFINITY
    }
}

/// Softmax that tolerates infinite entries. With any `+inf` entry the mass
/// is split evenly among them; a row of only `-inf` maps to all zeros.
pub(crate) fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    if max == f32::INFINITY {
        let count = logits.iter().filter(|&&l| l == f32::INFINITY).count() as f32;
        return logits
            .iter()
            .map(|&l| if l == f32::INFINITY { 1.0 / count } else { 0.0 })
            .collect();
    }
    if !max.is_finite() {
        return vec![0.0; logits.len()];
    }
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Indices ordered by descending logit; equal logits keep vocabulary order.
fn sorted_desc(logits: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| {
        logits[b]
            .partial_cmp(&logits[a])
            .unwrap_or(Ordering::Equal)
    });
    order
}

/// Keep the `k` largest logits; the rest become `-inf`.
fn apply_top_k(logits: &mut [f32], k: usize) {
    if k >= logits.len() {
        return;
    }
    let order = sorted_desc(logits);
    for &idx in &order[k..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

/// Nucleus filter. In sorted order, every token after the first position
/// whose cumulative probability exceeds `top_p` is masked; the most probable
/// token always survives.
fn apply_top_p(logits: &mut [f32], top_p: f32) {
    let order = sorted_desc(logits);
    let sorted: Vec<f32> = order.iter().map(|&i| logits[i]).collect();
    let probs = softmax(&sorted);

    let mut cumulative = 0.0f32;
    let mut remove_from = order.len();
    for (pos, p) in probs.iter().enumerate() {
        cumulative += p;
        if cumulative > top_p {
            // Shifted by one: the token that crosses the threshold stays.
            remove_from = pos + 1;
            break;
        }
    }
    for &idx in &order[remove_from.max(1)..] {
        logits[idx] = f32::NEG_INFINITY;
    }
}

fn multinomial(probs: &[f32], seed: Option<u64>, step: usize) -> Result<SampleResult> {
    use rand::prelude::*;

    let mut rng: Box<dyn RngCore> = match seed {
        Some(s) => Box::new(StdRng::seed_from_u64(s.wrapping_add(step as u64))),
        None => Box::new(rand::thread_rng()),
    };

    let r: f32 = rng.r#gen();
    let mut cumulative = 0.0;
    let mut last_nonzero = None;
    for (i, &p) in probs.iter().enumerate() {
        if p <= 0.0 {
            continue;
        }
        cumulative += p;
        last_nonzero = Some(i);
        if cumulative > r {
            return Ok(SampleResult {
                token_id: i as u32,
                logprob: p.ln(),
            });
        }
    }

    // Rounding left the cumulative sum just short of `r`.
    let last = last_nonzero
        .ok_or_else(|| ServeError::InvalidArgument("no token has nonzero probability".into()))?;
    Ok(SampleResult {
        token_id: last as u32,
        logprob: probs[last].ln(),
    })
}
