use std::fmt;
use std::time::Duration;

use nanoserve_core::{GenerationOutput, Result};

/// Throughput of the reference engine on the original benchmark, tokens/s.
pub const BASELINE_THROUGHPUT: f64 = 1314.65;

#[derive(Debug, Clone, PartialEq)]
pub struct BenchReport {
    pub requests: usize,
    pub failed: usize,
    pub total_tokens: usize,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn from_results(results: &[Result<GenerationOutput>], elapsed: Duration) -> Self {
        let total_tokens = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .map(|o| o.tokens_generated())
            .sum();
        Self {
            requests: results.len(),
            failed: results.iter().filter(|r| r.is_err()).count(),
            total_tokens,
            elapsed,
        }
    }

    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.total_tokens as f64 / secs
        } else {
            0.0
        }
    }

    /// Percentage difference from [`BASELINE_THROUGHPUT`].
    pub fn baseline_delta_pct(&self) -> f64 {
        (self.throughput() - BASELINE_THROUGHPUT) / BASELINE_THROUGHPUT * 100.0
    }
}

impl fmt::Display for BenchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total Requests: {}", self.requests)?;
        if self.failed > 0 {
            writeln!(f, "Failed Requests: {}", self.failed)?;
        }
        writeln!(f, "Total Tokens: {}", self.total_tokens)?;
        writeln!(f, "Total Time: {:.2}s", self.elapsed.as_secs_f64())?;
        writeln!(f, "Throughput: {:.2} tokens/s", self.throughput())?;
        write!(f, "Baseline Comparison: {:+.2}%", self.baseline_delta_pct())
    }
}
