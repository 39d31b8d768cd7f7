//! nanoserve throughput benchmark over a synthetic model.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use nanoserve_backend_cpu::CpuBackend;
use nanoserve_bench::prompts::{generate_prompts, output_length};
use nanoserve_bench::runner::{run_tensor_parallel, run_workload, single_engine};
use nanoserve_bench::{BenchOutcome, ByteTokenizer, HfTokenizerAdapter, Mode, SyntheticModel};
use nanoserve_core::{
    EngineConfig, GenerationRequest, SamplingConfig, SamplingParams, Tokenizer,
};
use nanoserve_runtime::{EngineEvent, GenerationOrchestrator};

#[derive(Parser)]
#[command(name = "nanoserve-bench", about = "nanoserve throughput benchmark")]
struct Cli {
    /// Number of requests to benchmark
    #[arg(long, default_value = "256")]
    requests: usize,

    /// HuggingFace tokenizer.json; a byte-level tokenizer is used otherwise
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Engine configuration file (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tensor-parallel world size, overriding the configuration file
    #[arg(long)]
    tensor_parallel_size: Option<usize>,

    /// Output tokens per request; drawn from 100..=1024 when omitted
    #[arg(long)]
    max_tokens: Option<usize>,

    #[arg(long, default_value = "0.6")]
    temperature: f32,

    #[arg(long, default_value = "50")]
    top_k: i64,

    #[arg(long, default_value = "0.9")]
    top_p: f32,

    /// Seed for the workload and for sampling
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Drain a request queue in adaptive batches instead of one pass
    #[arg(long)]
    scheduled: bool,

    /// Stream one extra request to stdout before the benchmark
    #[arg(long)]
    stream: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(tp) = cli.tensor_parallel_size {
        config.tensor_parallel_size = tp;
    }
    config.validate()?;

    let (tokenizer, vocab_size): (Arc<dyn Tokenizer>, usize) = match &cli.tokenizer {
        Some(path) => {
            let tokenizer = HfTokenizerAdapter::from_file(path)?;
            let vocab_size = tokenizer.vocab_size();
            info!(
                vocab_size,
                eos = tokenizer.eos_token_id(),
                "loaded tokenizer from {}",
                path.display()
            );
            (Arc::new(tokenizer), vocab_size)
        }
        None => (Arc::new(ByteTokenizer), ByteTokenizer::VOCAB_SIZE),
    };

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let prompts = generate_prompts(cli.requests, &mut rng);
    let max_tokens = cli.max_tokens.unwrap_or_else(|| output_length(&mut rng));
    let sampling = SamplingConfig::try_from(SamplingParams {
        temperature: cli.temperature,
        top_k: cli.top_k,
        top_p: cli.top_p,
        max_tokens: i64::try_from(max_tokens)?,
        seed: Some(cli.seed),
        ..Default::default()
    })?;
    let mode = if cli.scheduled {
        Mode::Scheduled
    } else {
        Mode::Direct
    };

    println!("{}", "=".repeat(60));
    println!("nanoserve Performance Benchmark");
    println!("{}", "=".repeat(60));
    info!(
        requests = prompts.len(),
        max_tokens,
        tensor_parallel_size = config.tensor_parallel_size,
        ?mode,
        "generated workload"
    );

    let outcome = if config.tensor_parallel_size == 1 {
        let engine = Arc::new(single_engine(config, tokenizer, vocab_size)?);
        if cli.stream {
            if let Some(prompt) = prompts.first() {
                stream_one(&engine, prompt, &sampling).await?;
                engine.clear_caches();
            }
        }
        tokio::task::spawn_blocking(move || run_workload(&engine, &prompts, &sampling, mode))
            .await?
    } else {
        if cli.stream {
            warn!("--stream is ignored with tensor parallelism");
        }
        tokio::task::spawn_blocking(move || {
            run_tensor_parallel(config, tokenizer, vocab_size, &prompts, &sampling, mode)
        })
        .await??
    };

    print_results(&outcome);
    Ok(())
}

async fn stream_one(
    engine: &Arc<GenerationOrchestrator<CpuBackend, SyntheticModel>>,
    prompt: &str,
    sampling: &SamplingConfig,
) -> anyhow::Result<()> {
    let mut events = engine.stream(GenerationRequest {
        request_id: "stream-0".into(),
        prompt: prompt.to_string(),
        sampling: sampling.clone(),
    });
    let mut stdout = std::io::stdout();
    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::Token {
                text: Some(text), ..
            } => {
                write!(stdout, "{text}")?;
                stdout.flush()?;
            }
            EngineEvent::Token { .. } => {}
            EngineEvent::Finish { reason, output, .. } => {
                writeln!(stdout)?;
                info!(?reason, tokens = output.tokens_generated(), "stream finished");
            }
            EngineEvent::Error { error, .. } => anyhow::bail!("stream failed: {error}"),
        }
    }
    Ok(())
}

fn print_results(outcome: &BenchOutcome) {
    let stats = &outcome.stats;
    println!();
    println!("{}", "=".repeat(60));
    println!("BENCHMARK RESULTS");
    println!("{}", "=".repeat(60));
    println!("Engine: nanoserve");
    println!("{}", outcome.report);
    println!(
        "KV cache: {} entries, hit rate {:.2}%, {:.2} MB",
        stats.kv_cache.entry_count,
        stats.kv_cache.hit_rate * 100.0,
        stats.kv_cache.memory_bytes as f64 / (1024.0 * 1024.0)
    );
    println!(
        "Prefix cache: {} entries, hit rate {:.2}%",
        stats.prefix_cache.entry_count,
        stats.prefix_cache.hit_rate * 100.0
    );
    if stats.batching.total_batches > 0 {
        println!(
            "Batching: {} batches, size {} (avg {:.2} tokens/s)",
            stats.batching.total_batches,
            stats.batching.current_size,
            stats.batching.avg_throughput
        );
    }
    if outcome.report.baseline_delta_pct() > 0.0 {
        println!("Performance improved vs baseline");
    } else {
        println!("Performance below baseline");
    }
}
