use nanoserve_core::{SamplingConfig, SamplingParams};
use nanoserve_runtime::{LogitProcessorPipeline, TokenSampler};
use proptest::prelude::*;

fn config(params: SamplingParams) -> SamplingConfig {
    SamplingConfig::try_from(params).unwrap()
}

#[test]
fn test_greedy_sampling() {
    let logits = vec![0.1, 0.3, 0.9, 0.2];
    let result = TokenSampler
        .sample(&logits, &SamplingConfig::greedy(8).unwrap(), 0)
        .unwrap();
    assert_eq!(result.token_id, 2);
    assert!(result.logprob < 0.0);
}

#[test]
fn test_greedy_ignores_top_k_and_top_p() {
    let logits = vec![0.5, 0.1, 0.8, 0.3];
    let cfg = config(SamplingParams {
        temperature: 0.0,
        top_k: 1,
        top_p: 0.0,
        seed: Some(3),
        ..Default::default()
    });
    for step in 0..10 {
        assert_eq!(TokenSampler.sample(&logits, &cfg, step).unwrap().token_id, 2);
    }
}

#[test]
fn test_seeded_sampling_is_reproducible() {
    let logits: Vec<f32> = (0..32).map(|i| ((i * 13) % 7) as f32 * 0.3).collect();
    let cfg = config(SamplingParams {
        temperature: 1.0,
        top_k: 0,
        seed: Some(1234),
        ..Default::default()
    });
    for step in 0..20 {
        let a = TokenSampler.sample(&logits, &cfg, step).unwrap();
        let b = TokenSampler.sample(&logits, &cfg, step).unwrap();
        assert_eq!(a.token_id, b.token_id);
        assert_eq!(a.logprob, b.logprob);
    }
}

#[test]
fn test_seeded_steps_vary() {
    let logits = vec![0.0f32; 64];
    let cfg = config(SamplingParams {
        top_k: 0,
        seed: Some(99),
        ..Default::default()
    });
    let draws: std::collections::HashSet<u32> = (0..32)
        .map(|step| TokenSampler.sample(&logits, &cfg, step).unwrap().token_id)
        .collect();
    assert!(draws.len() > 1);
}

#[test]
fn test_top_p_zero_keeps_only_most_probable() {
    let logits = vec![1.0, 1.5, 0.2, 1.4, -3.0];
    let cfg = config(SamplingParams {
        top_k: 0,
        top_p: 0.0,
        ..Default::default()
    });
    for step in 0..50 {
        let r = TokenSampler.sample(&logits, &cfg, step).unwrap();
        assert_eq!(r.token_id, 1);
        assert_eq!(r.logprob, 0.0);
    }
}

#[test]
fn test_top_k_restricts_candidates() {
    let logits = vec![2.0, 0.0, 1.9, 0.1, 1.8];
    for seed in 0..100 {
        let cfg = config(SamplingParams {
            top_k: 2,
            seed: Some(seed),
            ..Default::default()
        });
        let id = TokenSampler.sample(&logits, &cfg, 0).unwrap().token_id;
        assert!(id == 0 || id == 2, "token {id} outside top-2");
    }
}

#[test]
fn test_top_p_restricts_candidates() {
    // probs ~ [0.64, 0.24, 0.09, 0.03]; top_p 0.7 keeps ids 0 and 1.
    let logits = vec![3.0, 2.0, 1.0, 0.0];
    for seed in 0..100 {
        let cfg = config(SamplingParams {
            top_k: 0,
            top_p: 0.7,
            seed: Some(seed),
            ..Default::default()
        });
        let id = TokenSampler.sample(&logits, &cfg, 0).unwrap().token_id;
        assert!(id <= 1, "token {id} outside nucleus");
    }
}

#[test]
fn test_low_temperature_approaches_greedy() {
    let logits = vec![1.0, 3.0, 2.0];
    let cfg = config(SamplingParams {
        temperature: 0.01,
        top_k: 0,
        seed: Some(5),
        ..Default::default()
    });
    for step in 0..20 {
        assert_eq!(TokenSampler.sample(&logits, &cfg, step).unwrap().token_id, 1);
    }
}

#[test]
fn test_empty_logits_rejected() {
    assert!(TokenSampler
        .sample(&[], &SamplingConfig::greedy(1).unwrap(), 0)
        .is_err());
}

#[test]
fn test_repetition_penalty() {
    let mut logits = vec![1.0, 2.0, -3.0, 4.0];
    let cfg = config(SamplingParams {
        repetition_penalty: 2.0,
        min_tokens: 0,
        ..Default::default()
    });
    let pipeline = LogitProcessorPipeline::from_config(&cfg, 99);
    pipeline.apply(&mut logits, &[1, 2, 1, 1]);
    assert!((logits[1] - 1.0).abs() < 1e-6); // 2.0 / 2.0, once
    assert!((logits[2] + 6.0).abs() < 1e-6); // -3.0 * 2.0
    assert_eq!(logits[0], 1.0);
    assert_eq!(logits[3], 4.0);
}

#[test]
fn test_default_repetition_penalty_is_noop() {
    let mut logits = vec![1.0, -2.0];
    let cfg = config(SamplingParams {
        min_tokens: 0,
        ..Default::default()
    });
    LogitProcessorPipeline::from_config(&cfg, 5).apply(&mut logits, &[0, 1]);
    assert_eq!(logits, vec![1.0, -2.0]);
}

#[test]
fn test_min_tokens_masks_eos() {
    let cfg = config(SamplingParams {
        min_tokens: 2,
        ..Default::default()
    });
    let pipeline = LogitProcessorPipeline::from_config(&cfg, 0);

    let mut logits = vec![9.0, 1.0, 2.0];
    pipeline.apply(&mut logits, &[1]);
    assert_eq!(logits[0], f32::NEG_INFINITY);

    let mut logits = vec![9.0, 1.0, 2.0];
    pipeline.apply(&mut logits, &[1, 2]);
    assert_eq!(logits[0], 9.0);
}

#[test]
fn test_min_tokens_keeps_eos_when_nothing_else_is_possible() {
    let cfg = config(SamplingParams {
        min_tokens: 5,
        ..Default::default()
    });
    let mut logits = vec![f32::NEG_INFINITY, 0.5, f32::NEG_INFINITY];
    LogitProcessorPipeline::from_config(&cfg, 1).apply(&mut logits, &[]);
    assert_eq!(logits[1], 0.5);
}

#[test]
fn test_zero_repetition_penalty_still_samples() {
    let cfg = config(SamplingParams {
        temperature: 1.0,
        top_k: 0,
        repetition_penalty: 0.0,
        min_tokens: 0,
        seed: Some(17),
        ..Default::default()
    });
    let mut logits = vec![1.0, 2.0, 0.5];
    LogitProcessorPipeline::from_config(&cfg, 99).apply(&mut logits, &[0]);
    assert_eq!(logits[0], f32::MAX);
    assert!(logits.iter().all(|l| l.is_finite()));

    for step in 0..10 {
        let r = TokenSampler.sample(&logits, &cfg, step).unwrap();
        assert_eq!(r.token_id, 0);
        assert_eq!(r.logprob, 0.0);
    }
}

#[test]
fn test_tiny_temperature_still_samples() {
    let cfg = config(SamplingParams {
        temperature: 1e-38,
        top_k: 0,
        seed: Some(2),
        ..Default::default()
    });
    let r = TokenSampler.sample(&[5.0, 1.0], &cfg, 0).unwrap();
    assert_eq!(r.token_id, 0);
    assert!(r.logprob.is_finite());

    let with_top_p = config(SamplingParams {
        temperature: 1e-38,
        top_p: 0.5,
        ..Default::default()
    });
    assert_eq!(TokenSampler.sample(&[1.0, 5.0], &with_top_p, 3).unwrap().token_id, 1);
}

#[test]
fn test_infinite_logit_takes_all_mass() {
    let cfg = config(SamplingParams {
        top_k: 0,
        seed: Some(8),
        ..Default::default()
    });
    for step in 0..10 {
        let r = TokenSampler.sample(&[0.3, f32::INFINITY, 9.0], &cfg, step).unwrap();
        assert_eq!(r.token_id, 1);
    }
}

proptest! {
    #[test]
    fn sampled_token_is_in_range_and_survives_filters(
        logits in prop::collection::vec(-20.0f32..20.0, 1..64),
        temperature in 0.05f32..2.0,
        top_k in 0i64..16,
        top_p in 0.0f32..=1.0,
        seed in any::<u64>(),
        step in 0usize..1000,
    ) {
        let cfg = config(SamplingParams {
            temperature,
            top_k,
            top_p,
            seed: Some(seed),
            ..Default::default()
        });
        let r = TokenSampler.sample(&logits, &cfg, step).unwrap();
        prop_assert!((r.token_id as usize) < logits.len());
        prop_assert!(r.logprob.is_finite());
        prop_assert!(r.logprob <= 0.0);
        if top_k > 0 {
            let rank = logits
                .iter()
                .filter(|&&l| l > logits[r.token_id as usize])
                .count();
            prop_assert!(rank < top_k as usize);
        }
    }

    #[test]
    fn greedy_matches_argmax(logits in prop::collection::vec(-5.0f32..5.0, 1..64)) {
        let r = TokenSampler.sample(&logits, &SamplingConfig::greedy(1).unwrap(), 0).unwrap();
        let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        prop_assert_eq!(logits[r.token_id as usize], max);
    }
}
