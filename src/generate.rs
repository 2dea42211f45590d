//! Autoregressive sampling and the parity check on generated text

use anyhow::{anyhow, ensure, Result};
use candle_core::{DType, IndexOp, Tensor};
use rand::Rng;
use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::GenerationConfig;
use crate::dfa::Dfa;
use crate::model::ParityTransformer;
use crate::sampler::LabeledBatch;
use crate::tokens::{self, PAD_TOKEN};

/// Sample one token id from a row of logits
///
/// `temperature <= 0` picks the argmax.
pub fn sample_from_logits(logits: &[f32], temperature: f32, rng: &mut impl Rng) -> Result<u32> {
    if temperature <= 0.0 {
        let (max_idx, _) = logits
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| anyhow!("Empty logits"))?;
        return Ok(max_idx as u32);
    }

    let scaled: Vec<f32> = logits.iter().map(|x| x / temperature).collect();
    let max_val = scaled.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    ensure!(max_val.is_finite(), "Logits contain no finite value");
    let exp_vals: Vec<f32> = scaled.iter().map(|x| (x - max_val).exp()).collect();
    let sum: f32 = exp_vals.iter().sum();

    let r: f32 = rng.gen::<f32>() * sum;
    let mut cumsum = 0.0;
    for (idx, &p) in exp_vals.iter().enumerate() {
        cumsum += p;
        if r < cumsum {
            return Ok(idx as u32);
        }
    }
    Ok((exp_vals.len() - 1) as u32)
}

/// Extend every seed row by up to `max_new_tokens` sampled tokens
///
/// Rows are processed as one batch through the KV cache. After a row emits
/// `eos_token_id` it is padded with that token, and sampling stops once every
/// row has finished. The total length never exceeds `n_ctx`.
pub fn generate(
    model: &ParityTransformer,
    seeds: &[Vec<u32>],
    config: &GenerationConfig,
    rng: &mut impl Rng,
) -> Result<Vec<Vec<u32>>> {
    ensure!(!seeds.is_empty(), "No seed sequences given");
    let seed_len = seeds[0].len();
    ensure!(seed_len > 0, "Seed sequences must hold at least one token");
    ensure!(
        seeds.iter().all(|s| s.len() == seed_len),
        "Seed sequences must share one length"
    );
    ensure!(
        seed_len <= model.n_ctx(),
        "Seed length {seed_len} exceeds n_ctx {}",
        model.n_ctx()
    );

    let max_new = config.max_new_tokens.min(model.n_ctx() - seed_len);
    if max_new < config.max_new_tokens {
        debug!(
            "Capping max_new_tokens {} to {max_new} to fit n_ctx",
            config.max_new_tokens
        );
    }

    let batch = seeds.len();
    let mut sequences: Vec<Vec<u32>> = seeds.to_vec();
    let mut finished = vec![false; batch];
    if max_new == 0 {
        return Ok(sequences);
    }

    let flat: Vec<u32> = seeds.iter().flatten().copied().collect();
    let input = Tensor::from_vec(flat, (batch, seed_len), model.device())?;
    let mut kv_cache = model.new_kv_cache();
    let logits = model.forward_with_kv_cache(&input, &mut kv_cache)?;
    let mut last = logits.i((.., seed_len - 1, ..))?;

    for step in 0..max_new {
        let rows: Vec<Vec<f32>> = last.to_dtype(DType::F32)?.to_vec2()?;
        let mut next = Vec::with_capacity(batch);
        for (i, row) in rows.iter().enumerate() {
            let token = match (finished[i], config.eos_token_id) {
                (true, Some(eos)) => eos,
                _ => sample_from_logits(row, config.temperature, rng)?,
            };
            if config.eos_token_id == Some(token) {
                finished[i] = true;
            }
            sequences[i].push(token);
            next.push(token);
        }

        if finished.iter().all(|&f| f) {
            debug!("All sequences finished after {} new tokens", step + 1);
            break;
        }
        if step + 1 < max_new {
            let input = Tensor::from_vec(next, (batch, 1), model.device())?;
            let logits = model.forward_with_kv_cache(&input, &mut kv_cache)?;
            last = logits.i((.., 0, ..))?;
        }
    }

    debug!(
        "KV cache held {} positions, {:.2} MB",
        kv_cache.seq_len(),
        kv_cache.memory_usage() as f64 / 1e6
    );
    Ok(sequences)
}

/// `n` copies of the single-token seed `[0]`
pub fn zero_seeds(n: usize) -> Vec<Vec<u32>> {
    vec![vec![PAD_TOKEN]; n]
}

/// Generated words of one length, split by parity of the target symbol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParityCounts {
    pub even: usize,
    pub odd: usize,
}

/// Result of a two-proportion z-test
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ZTest {
    pub z: f64,
    /// Two-sided p-value
    pub p_value: f64,
}

/// Two-sided test of `successes_a / n_a == successes_b / n_b`
pub fn proportion_z_test(
    successes_a: usize,
    n_a: usize,
    successes_b: usize,
    n_b: usize,
) -> Result<ZTest> {
    ensure!(n_a > 0 && n_b > 0, "Both samples must be non-empty");
    let p_a = successes_a as f64 / n_a as f64;
    let p_b = successes_b as f64 / n_b as f64;
    let pooled = (successes_a + successes_b) as f64 / (n_a + n_b) as f64;
    let se = (pooled * (1.0 - pooled) * (1.0 / n_a as f64 + 1.0 / n_b as f64)).sqrt();
    if se == 0.0 {
        // Both samples are all successes or all failures
        return Ok(ZTest { z: 0.0, p_value: 1.0 });
    }
    let z = (p_a - p_b) / se;
    let normal = Normal::new(0.0, 1.0).map_err(|e| anyhow!("Standard normal: {e}"))?;
    let p_value = 2.0 * (1.0 - normal.cdf(z.abs()));
    Ok(ZTest { z, p_value })
}

/// Parity statistics over generated sequences
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationReport {
    pub target_symbol: char,
    /// Decoded words with zero bytes stripped
    pub strings: Vec<String>,
    /// Whether each word has an even count of the target symbol
    pub even: Vec<bool>,
    /// Whether each word is in the training language
    pub accepted: Vec<bool>,
    pub even_fraction: f64,
    pub accepted_fraction: f64,
    /// Word length to parity counts
    pub length_histogram: BTreeMap<usize, ParityCounts>,
}

impl GenerationReport {
    pub fn new(sequences: &[Vec<u32>], target: u8, dfa: &Dfa) -> Self {
        let strings: Vec<String> = sequences.iter().map(|s| tokens::decode(s)).collect();
        let even: Vec<bool> = sequences
            .iter()
            .map(|s| tokens::has_even_count(s, target))
            .collect();
        let accepted: Vec<bool> = strings.iter().map(|s| dfa.accepts(s.as_bytes())).collect();

        let mut length_histogram: BTreeMap<usize, ParityCounts> = BTreeMap::new();
        for (s, &is_even) in strings.iter().zip(&even) {
            let counts = length_histogram.entry(s.chars().count()).or_default();
            if is_even {
                counts.even += 1;
            } else {
                counts.odd += 1;
            }
        }

        let fraction = |flags: &[bool]| {
            if flags.is_empty() {
                0.0
            } else {
                flags.iter().filter(|&&f| f).count() as f64 / flags.len() as f64
            }
        };

        Self {
            target_symbol: char::from(target),
            even_fraction: fraction(&even),
            accepted_fraction: fraction(&accepted),
            strings,
            even,
            accepted,
            length_histogram,
        }
    }

    pub fn n_samples(&self) -> usize {
        self.strings.len()
    }

    pub fn n_even(&self) -> usize {
        self.even.iter().filter(|&&e| e).count()
    }

    /// Compare the generated even fraction with a reference sample
    pub fn compare_to(&self, n_even: usize, n_total: usize) -> Result<ZTest> {
        proportion_z_test(self.n_even(), self.n_samples(), n_even, n_total)
    }

    /// Log the headline numbers
    pub fn log_summary(&self) {
        info!(
            "{} samples: {:.1}% even '{}' count, {:.1}% in language",
            self.n_samples(),
            self.even_fraction * 100.0,
            self.target_symbol,
            self.accepted_fraction * 100.0
        );
    }
}

/// `(even, total)` counts of the target symbol over training batches
pub fn data_parity_counts<'a>(
    batches: impl IntoIterator<Item = &'a LabeledBatch>,
    target: u8,
) -> (usize, usize) {
    let mut even = 0;
    let mut total = 0;
    for batch in batches {
        for row in &batch.tokens {
            total += 1;
            if tokens::has_even_count(row, target) {
                even += 1;
            }
        }
    }
    (even, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, PARITY_REGEX};
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_model(n_ctx: usize) -> ParityTransformer {
        let cfg = ModelConfig {
            d_model: 16,
            d_head: 4,
            n_heads: 4,
            d_mlp: 32,
            n_layers: 2,
            n_ctx,
            initializer_range: 0.5,
            ..Default::default()
        };
        ParityTransformer::new(&cfg, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_greedy_sampling() {
        let mut rng = StdRng::seed_from_u64(0);
        let token = sample_from_logits(&[0.1, 3.0, -1.0, 2.9], 0.0, &mut rng).unwrap();
        assert_eq!(token, 1);
        assert!(sample_from_logits(&[], 0.0, &mut rng).is_err());
    }

    #[test]
    fn test_temperature_sampling_follows_distribution() {
        let mut rng = StdRng::seed_from_u64(7);
        // Probabilities ~ [0.12, 0.88]
        let logits = [0.0f32, 2.0];
        let ones = (0..2000)
            .filter(|_| sample_from_logits(&logits, 1.0, &mut rng).unwrap() == 1)
            .count();
        assert!((1650..1850).contains(&ones), "got {ones}");

        // A dominant logit always wins at low temperature
        let token = sample_from_logits(&[0.0, 1.0, 0.0], 0.01, &mut rng).unwrap();
        assert_eq!(token, 1);
    }

    #[test]
    fn test_generate_shapes_and_cap() {
        let model = small_model(8);
        let config = GenerationConfig {
            n_samples: 5,
            max_new_tokens: 31,
            temperature: 1.0,
            eos_token_id: None,
        };
        let mut rng = StdRng::seed_from_u64(1);
        let out = generate(&model, &zero_seeds(5), &config, &mut rng).unwrap();
        assert_eq!(out.len(), 5);
        assert!(out.iter().all(|s| s.len() == 8 && s[0] == 0));
    }

    #[test]
    fn test_generation_is_seeded() {
        let model = small_model(10);
        let config = GenerationConfig::default();
        let a = generate(&model, &zero_seeds(4), &config, &mut StdRng::seed_from_u64(3)).unwrap();
        let b = generate(&model, &zero_seeds(4), &config, &mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_eos_pads_and_stops() {
        let model = small_model(12);
        let config = GenerationConfig {
            n_samples: 16,
            max_new_tokens: 11,
            temperature: 1.0,
            eos_token_id: Some(0),
        };
        let mut rng = StdRng::seed_from_u64(11);
        let out = generate(&model, &zero_seeds(16), &config, &mut rng).unwrap();
        let len = out[0].len();
        assert!(out.iter().all(|s| s.len() == len));
        assert!(len <= 12);
        // Nothing but EOS after the first EOS
        for seq in &out {
            if let Some(pos) = seq[1..].iter().position(|&t| t == 0) {
                assert!(seq[1 + pos..].iter().all(|&t| t == 0));
            }
        }
    }

    #[test]
    fn test_rejects_bad_seeds() {
        let model = small_model(6);
        let config = GenerationConfig::default();
        let mut rng = StdRng::seed_from_u64(0);
        assert!(generate(&model, &[], &config, &mut rng).is_err());
        assert!(generate(&model, &[vec![0], vec![0, 1]], &config, &mut rng).is_err());
        assert!(generate(&model, &[vec![0; 7]], &config, &mut rng).is_err());
    }

    #[test]
    fn test_report_counts() {
        let dfa = Dfa::from_regex(PARITY_REGEX).unwrap();
        let seqs = vec![
            tokens_of("\0AA\0\0"),
            tokens_of("\0BAB\0"),
            tokens_of("\0CB\0\0"),
            tokens_of("\0ABA\0"),
        ];
        let report = GenerationReport::new(&seqs, b'A', &dfa);
        assert_eq!(report.strings, vec!["AA", "BAB", "CB", "ABA"]);
        assert_eq!(report.even, vec![true, false, true, true]);
        assert_eq!(report.accepted, vec![true, false, true, true]);
        assert_eq!(report.even_fraction, 0.75);
        assert_eq!(report.length_histogram[&2], ParityCounts { even: 2, odd: 0 });
        assert_eq!(report.length_histogram[&3], ParityCounts { even: 1, odd: 1 });
    }

    fn tokens_of(s: &str) -> Vec<u32> {
        tokens::encode(s.as_bytes())
    }

    #[test]
    fn test_proportion_z_test() {
        let same = proportion_z_test(50, 100, 500, 1000).unwrap();
        assert!(same.z.abs() < 1e-12);
        assert!((same.p_value - 1.0).abs() < 1e-9);

        let different = proportion_z_test(90, 100, 50, 100).unwrap();
        assert!(different.z > 5.0);
        assert!(different.p_value < 1e-6);

        let degenerate = proportion_z_test(10, 10, 20, 20).unwrap();
        assert_eq!(degenerate.p_value, 1.0);
        assert!(proportion_z_test(0, 0, 1, 1).is_err());
    }

    #[test]
    fn test_data_parity_counts() {
        let batch = LabeledBatch {
            tokens: vec![tokens_of("\0AAB"), tokens_of("\0ABB"), tokens_of("\0BBB")],
            states: vec![],
        };
        assert_eq!(data_parity_counts([&batch], b'A'), (2, 3));
    }
}
