//! Synthetic benchmark workload.

use rand::seq::SliceRandom;
use rand::Rng;

const BASE_PROMPTS: &[&str] = &[
    "Explain the concept of",
    "Write a story about",
    "Describe the process of",
    "What are the benefits of",
    "How does technology impact",
];

const TOPICS: &[&str] = &[
    "artificial intelligence",
    "quantum computing",
    "climate change",
    "renewable energy",
    "space exploration",
    "genetic engineering",
    "blockchain technology",
    "virtual reality",
    "machine learning",
];

pub const CONTEXT_WORDS_MIN: usize = 20;
pub const CONTEXT_WORDS_MAX: usize = 200;
pub const OUTPUT_TOKENS_MIN: usize = 100;
pub const OUTPUT_TOKENS_MAX: usize = 1024;

/// `count` prompts of the form `"{base} {topic}. context context ..."` with
/// 20 to 200 filler words each.
pub fn generate_prompts<R: Rng + ?Sized>(count: usize, rng: &mut R) -> Vec<String> {
    (0..count)
        .map(|_| {
            let base = BASE_PROMPTS.choose(rng).copied().unwrap_or("Explain the concept of");
            let topic = TOPICS.choose(rng).copied().unwrap_or("machine learning");
            let words = rng.gen_range(CONTEXT_WORDS_MIN..=CONTEXT_WORDS_MAX);
            let context = vec!["context"; words].join(" ");
            format!("{base} {topic}. {context}")
        })
        .collect()
}

/// One output length for the whole run, drawn like the prompt lengths.
pub fn output_length<R: Rng + ?Sized>(rng: &mut R) -> usize {
    rng.gen_range(OUTPUT_TOKENS_MIN..=OUTPUT_TOKENS_MAX)
}
