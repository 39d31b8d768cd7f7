//! Batch sizing from memory pressure, queue depth and observed throughput.
//!
//! Two independent signals live here. [`AdaptiveBatchController::recommend`]
//! is a pure function of the current memory and queue state.
//! [`AdaptiveBatchController::record`] feeds a rolling throughput history that
//! nudges `current_size` up or down one step at a time.

use std::collections::VecDeque;

use nanoserve_core::{EngineConfig, Result, ServeError};
use tracing::{debug, warn};

/// Memory fraction at which the memory factor saturates.
const MEMORY_THRESHOLD: f64 = 0.8;
/// History length that triggers trimming, and the length kept afterwards.
const HISTORY_LIMIT: usize = 100;
const HISTORY_KEEP: usize = 50;
/// Samples in the "recent" window, and the minimum history to adapt at all.
const RECENT_WINDOW: usize = 5;
const ADAPT_MARGIN: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct BatchState {
    pub min_size: usize,
    pub max_size: usize,
    pub current_size: usize,
    /// `(batch_size, throughput)` in recording order.
    pub history: VecDeque<(usize, f64)>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    pub current_size: usize,
    /// Mean throughput over the retained history; 0 when empty.
    pub avg_throughput: f64,
    /// Samples currently retained, not lifetime batches.
    pub total_batches: usize,
    pub min_size: usize,
    pub max_size: usize,
}

pub struct AdaptiveBatchController {
    state: BatchState,
}

impl AdaptiveBatchController {
    pub fn new(min_size: usize, max_size: usize) -> Result<Self> {
        if min_size == 0 || min_size > max_size {
            return Err(ServeError::InvalidConfig(format!(
                "batch bounds must satisfy 0 < min ({min_size}) <= max ({max_size})"
            )));
        }
        Ok(Self {
            state: BatchState {
                min_size,
                max_size,
                current_size: min_size,
                history: VecDeque::with_capacity(HISTORY_LIMIT + 1),
            },
        })
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        Self::new(config.min_batch_size, config.max_batch_size)
    }

    /// Suggested batch size for the next tick, always within
    /// `[min_size, max_size]`.
    ///
    /// `available_memory_fraction` is clamped to `[0, 1]`; NaN counts as 0.
    pub fn recommend(&self, available_memory_fraction: f64, queue_depth: usize) -> usize {
        let max = self.state.max_size as f64;
        let fraction = if available_memory_fraction.is_nan() {
            0.0
        } else {
            available_memory_fraction.clamp(0.0, 1.0)
        };
        let memory_factor = (fraction / MEMORY_THRESHOLD).min(1.0);
        let queue_factor = (queue_depth as f64 / max).min(1.0);
        let suggested = (max * memory_factor * queue_factor).floor() as usize;
        suggested.clamp(self.state.min_size, self.state.max_size)
    }

    /// Record the throughput achieved by a batch and adapt `current_size`.
    pub fn record(&mut self, batch_size: usize, throughput: f64) {
        if !throughput.is_finite() || throughput < 0.0 {
            warn!(batch_size, throughput, "ignoring invalid throughput sample");
            return;
        }
        let history = &mut self.state.history;
        history.push_back((batch_size, throughput));
        if history.len() > HISTORY_LIMIT {
            let excess = history.len() - HISTORY_KEEP;
            history.drain(..excess);
        }
        if history.len() < RECENT_WINDOW {
            return;
        }

        let overall = mean(history.iter());
        let recent = mean(history.iter().skip(history.len() - RECENT_WINDOW));
        let before = self.state.current_size;
        if recent > overall * (1.0 + ADAPT_MARGIN) {
            self.state.current_size = (before + 1).min(self.state.max_size);
        } else if recent < overall * (1.0 - ADAPT_MARGIN) {
            self.state.current_size = before.saturating_sub(1).max(self.state.min_size);
        }
        if self.state.current_size != before {
            debug!(
                from = before,
                to = self.state.current_size,
                recent,
                overall,
                "adjusted learned batch size"
            );
        }
    }

    pub fn current_size(&self) -> usize {
        self.state.current_size
    }

    pub fn min_size(&self) -> usize {
        self.state.min_size
    }

    pub fn max_size(&self) -> usize {
        self.state.max_size
    }

    pub fn state(&self) -> &BatchState {
        &self.state
    }

    pub fn stats(&self) -> BatchStats {
        let history = &self.state.history;
        BatchStats {
            current_size: self.state.current_size,
            avg_throughput: if history.is_empty() {
                0.0
            } else {
                mean(history.iter())
            },
            total_batches: history.len(),
            min_size: self.state.min_size,
            max_size: self.state.max_size,
        }
    }
}

fn mean<'a>(samples: impl ExactSizeIterator<Item = &'a (usize, f64)>) -> f64 {
    let n = samples.len().max(1);
    samples.map(|(_, t)| t).sum::<f64>() / n as f64
}
