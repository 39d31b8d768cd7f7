//! Benchmark harness for nanoserve: synthetic workload, a deterministic
//! model, tokenizer adapters, and the throughput report.

pub mod prompts;
pub mod report;
pub mod runner;
pub mod synthetic;
pub mod tokenizer;

pub use report::{BenchReport, BASELINE_THROUGHPUT};
pub use runner::{BenchOutcome, Mode};
pub use synthetic::SyntheticModel;
pub use tokenizer::{ByteTokenizer, HfTokenizerAdapter};
