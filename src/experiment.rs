//! Experiment runner
//!
//! Coordinates data sampling, training, generation with the parity check,
//! and linear probing of the residual stream.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use ndarray::Array1;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::cache::HookPoint;
use crate::checkpoint::{load_weights, save_weights};
use crate::config::ExperimentConfig;
use crate::dfa::Dfa;
use crate::generate::{self, GenerationReport, ZTest};
use crate::model::ParityTransformer;
use crate::probe::{tensor_to_array2, ProbeResults, ProbeTrainer};
use crate::sampler::{DfaGenerator, LabeledBatch};
use crate::train::{Trainer, TrainingReport};

/// Sequences per forward pass when collecting activations
const ACTIVATION_CHUNK: usize = 256;

/// Check that every probed state label is 1 or 2
///
/// # Panics
///
/// Panics on any other value: the probing labels would be meaningless.
pub fn assert_binary_states(states: &[Vec<u32>]) {
    for (row, values) in states.iter().enumerate() {
        for (pos, &state) in values.iter().enumerate().skip(1) {
            assert!(
                state == 1 || state == 2,
                "state {state} at row {row}, position {pos} is outside {{1, 2}}"
            );
        }
    }
}

/// Probe targets: `states[:, 1:] - 1`, flattened row-major
pub fn probe_labels(batch: &LabeledBatch) -> Array1<usize> {
    assert_binary_states(&batch.states);
    batch
        .states
        .iter()
        .flat_map(|row| row[1..].iter().map(|&s| (s - 1) as usize))
        .collect()
}

/// Run `tokens` through the model in chunks and keep only the requested
/// residual activations, each flattened to `(batch * pos, d_model)`
pub fn collect_activations(
    model: &ParityTransformer,
    tokens: &Tensor,
    targets: &[(HookPoint, usize)],
) -> Result<BTreeMap<(HookPoint, usize), Tensor>> {
    let n = tokens.dim(0)?;
    let mut pieces: BTreeMap<(HookPoint, usize), Vec<Tensor>> = BTreeMap::new();
    let mut start = 0;
    while start < n {
        let len = ACTIVATION_CHUNK.min(n - start);
        let (_, cache) = model.run_with_cache(&tokens.narrow(0, start, len)?)?;
        for &(hook, layer) in targets {
            pieces
                .entry((hook, layer))
                .or_default()
                .push(cache.flatten_positions(hook, layer)?);
        }
        start += len;
    }
    pieces
        .into_iter()
        .map(|(key, parts)| Ok((key, Tensor::cat(&parts, 0)?)))
        .collect()
}

/// One fitted probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayerProbe {
    pub layer: usize,
    pub location: HookPoint,
    pub results: ProbeResults,
}

/// Results from probing every (layer, location)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeReport {
    pub layer_results: Vec<LayerProbe>,
    pub best_layer: usize,
    pub best_location: HookPoint,
    pub best_accuracy: f64,
    /// Number of (sequence, position) samples per probe
    pub n_samples: usize,
    /// Scored on a held-out split rather than the fitting data
    pub held_out: bool,
}

/// Generation results compared against the training distribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub report: GenerationReport,
    /// Even fraction over an equally sized sample of training words
    pub data_even_fraction: f64,
    pub z_test: ZTest,
}

/// Results from a full experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResults {
    /// `None` when weights were loaded instead of trained
    pub training: Option<TrainingReport>,
    pub generation: GenerationSummary,
    pub probes: ProbeReport,
}

/// Main experiment runner
pub struct Experiment {
    config: ExperimentConfig,
    generator: DfaGenerator,
    device: Device,
}

impl Experiment {
    pub fn new(config: ExperimentConfig, device: Device) -> Result<Self> {
        config.validate()?;
        let generator = DfaGenerator::from_regex(&config.regex)
            .with_context(|| format!("Failed to compile regex '{}'", config.regex))?;
        info!(
            "Language '{}': {} live states over {:?}",
            config.regex,
            generator.dfa().live_states().count(),
            String::from_utf8_lossy(generator.dfa().alphabet())
        );
        Ok(Self {
            config,
            generator,
            device,
        })
    }

    pub fn dfa(&self) -> &Dfa {
        self.generator.dfa()
    }

    /// Stage seeds derived from the experiment seed
    fn stage_seed(&self, stage: u64) -> u64 {
        self.config.seed.wrapping_add(stage)
    }

    /// Fresh model from the configured architecture
    pub fn build_model(&self) -> Result<ParityTransformer> {
        ParityTransformer::new(&self.config.model, &self.device)
    }

    fn sample_batch(&self, batch_size: usize, seed: u64) -> Result<LabeledBatch> {
        self.generator
            .batches_and_states(self.config.word_len(), batch_size, self.config.length_mode, seed)?
            .next()
            .context("Sampler yielded no batch")?
    }

    pub fn train(&self, model: &ParityTransformer) -> Result<TrainingReport> {
        let batches = self.generator.batches_and_states(
            self.config.word_len(),
            self.config.train.batch_size,
            self.config.length_mode,
            self.stage_seed(0),
        )?;
        info!("Model size: {:.2} MB", model.size_mb());
        Trainer::new(self.config.train.clone()).train(model, batches)
    }

    /// Load `weights` when present, otherwise train and save to it
    pub fn prepare_model(
        &self,
        weights: &Path,
        retrain: bool,
    ) -> Result<(ParityTransformer, Option<TrainingReport>)> {
        let mut model = self.build_model()?;
        if weights.exists() && !retrain {
            info!("Loading weights from {}", weights.display());
            load_weights(&mut model, weights)?;
            return Ok((model, None));
        }
        let report = self.train(&model)?;
        save_weights(&model, weights)?;
        Ok((model, Some(report)))
    }

    /// Sample from all-zero seeds and check the parity of the target symbol
    pub fn generate(&self, model: &ParityTransformer) -> Result<GenerationSummary> {
        let cfg = &self.config.generation;
        let mut rng = StdRng::seed_from_u64(self.stage_seed(1));
        let seeds = generate::zero_seeds(cfg.n_samples);
        let sequences = generate::generate(model, &seeds, cfg, &mut rng)?;
        let report = GenerationReport::new(&sequences, self.config.target_byte(), self.dfa());
        report.log_summary();

        let reference = self.sample_batch(cfg.n_samples.max(1), self.stage_seed(4))?;
        let (data_even, data_total) =
            generate::data_parity_counts([&reference], self.config.target_byte());
        let z_test = report.compare_to(data_even, data_total)?;
        let data_even_fraction = data_even as f64 / data_total as f64;
        info!(
            "Training data: {:.1}% even; z = {:.3}, p = {:.4}",
            data_even_fraction * 100.0,
            z_test.z,
            z_test.p_value
        );

        Ok(GenerationSummary {
            report,
            data_even_fraction,
            z_test,
        })
    }

    /// Fit one probe per (layer, location) on a fresh batch of sequences
    ///
    /// # Panics
    ///
    /// Panics if the language's states are not exactly {1, 2}.
    pub fn probe(&self, model: &ParityTransformer) -> Result<ProbeReport> {
        let cfg = &self.config.probe;
        let batch = self.sample_batch(cfg.n_sequences, self.stage_seed(2))?;
        let labels = probe_labels(&batch);

        let layers: Vec<usize> = if cfg.layers.is_empty() {
            (0..model.n_layers()).collect()
        } else {
            cfg.layers.clone()
        };
        for &layer in &layers {
            anyhow::ensure!(
                layer < model.n_layers(),
                "Layer {layer} out of range for a {}-layer model",
                model.n_layers()
            );
        }
        let targets: Vec<(HookPoint, usize)> = layers
            .iter()
            .flat_map(|&layer| cfg.locations.iter().map(move |&hook| (hook, layer)))
            .collect();

        let tokens = batch.tokens_tensor(&self.device)?;
        let activations = collect_activations(model, &tokens, &targets)?;
        if cfg.train_ratio.is_none() {
            warn!("Probes are scored on their own fitting data");
        }

        let trainer = ProbeTrainer::new(cfg.max_iterations);
        let mut layer_results = Vec::with_capacity(targets.len());
        for &(location, layer) in &targets {
            let x = tensor_to_array2(&activations[&(location, layer)])?;
            let y = labels.clone();
            let results = match cfg.train_ratio {
                Some(ratio) => trainer.split_and_evaluate(x, y, ratio, self.stage_seed(3))?,
                None => trainer.fit_and_score(x, y)?,
            };
            info!(
                "Layer {layer} {location}: accuracy {:.2}%, F1 {:.3}",
                results.accuracy * 100.0,
                results.f1()
            );
            layer_results.push(LayerProbe {
                layer,
                location,
                results,
            });
        }

        let best = layer_results
            .iter()
            .max_by(|a, b| {
                a.results
                    .accuracy
                    .partial_cmp(&b.results.accuracy)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .context("No probes were fitted")?;
        let report = ProbeReport {
            best_layer: best.layer,
            best_location: best.location,
            best_accuracy: best.results.accuracy,
            n_samples: labels.len(),
            held_out: cfg.train_ratio.is_some(),
            layer_results,
        };
        info!(
            "Best probe: layer {} {} with {:.2}% accuracy",
            report.best_layer,
            report.best_location,
            report.best_accuracy * 100.0
        );
        Ok(report)
    }

    /// Train or load, then generate, then probe
    pub fn run(&self, weights: &Path, retrain: bool) -> Result<ExperimentResults> {
        info!("Starting parity experiment");
        let (model, training) = self.prepare_model(weights, retrain)?;
        let generation = self.generate(&model)?;
        let probes = self.probe(&model)?;
        Ok(ExperimentResults {
            training,
            generation,
            probes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GenerationConfig, ModelConfig, ProbeConfig, TrainConfig};

    fn tiny_experiment() -> ExperimentConfig {
        ExperimentConfig {
            word_len: Some(6),
            model: ModelConfig {
                d_model: 16,
                d_head: 4,
                n_heads: 4,
                d_mlp: 32,
                n_layers: 2,
                n_ctx: 8,
                ..Default::default()
            },
            train: TrainConfig {
                batch_size: 8,
                num_steps: 3,
                log_every: 1,
                ..Default::default()
            },
            generation: GenerationConfig {
                n_samples: 12,
                ..Default::default()
            },
            probe: ProbeConfig {
                n_sequences: 40,
                max_iterations: 50,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_probe_labels() {
        let batch = LabeledBatch {
            tokens: vec![vec![0, 65, 66], vec![0, 66, 65]],
            states: vec![vec![1, 1, 2, 2], vec![1, 1, 1, 2]],
        };
        assert_eq!(probe_labels(&batch).to_vec(), vec![0, 1, 1, 0, 0, 1]);
    }

    #[test]
    #[should_panic(expected = "outside {1, 2}")]
    fn test_dead_state_panics() {
        assert_binary_states(&[vec![1, 1, 0]]);
    }

    #[test]
    #[should_panic(expected = "outside {1, 2}")]
    fn test_extra_state_panics() {
        assert_binary_states(&[vec![1, 1, 2], vec![1, 3, 1]]);
    }

    #[test]
    fn test_collect_activations_chunks() {
        let exp = Experiment::new(tiny_experiment(), Device::Cpu).unwrap();
        let model = exp.build_model().unwrap();
        let batch = exp.sample_batch(ACTIVATION_CHUNK + 5, 0).unwrap();
        let tokens = batch.tokens_tensor(&Device::Cpu).unwrap();

        let targets = [(HookPoint::ResidMid, 1), (HookPoint::ResidPost, 0)];
        let acts = collect_activations(&model, &tokens, &targets).unwrap();
        assert_eq!(acts.len(), 2);
        let mid = &acts[&(HookPoint::ResidMid, 1)];
        assert_eq!(mid.dims(), &[(ACTIVATION_CHUNK + 5) * 7, 16]);

        // Same rows as an unchunked pass over the tail
        let tail = tokens.narrow(0, ACTIVATION_CHUNK, 5).unwrap();
        let (_, cache) = model.run_with_cache(&tail).unwrap();
        let direct: Vec<Vec<f32>> = cache
            .flatten_positions(HookPoint::ResidMid, 1)
            .unwrap()
            .to_vec2()
            .unwrap();
        let chunked: Vec<Vec<f32>> = mid
            .narrow(0, ACTIVATION_CHUNK * 7, 35)
            .unwrap()
            .to_vec2()
            .unwrap();
        for (a, b) in direct.iter().flatten().zip(chunked.iter().flatten()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_probe_report_layout() {
        let exp = Experiment::new(tiny_experiment(), Device::Cpu).unwrap();
        let model = exp.build_model().unwrap();
        let report = exp.probe(&model).unwrap();
        assert_eq!(report.layer_results.len(), 4);
        assert_eq!(report.n_samples, 40 * 7);
        assert!(!report.held_out);
        assert!(report
            .layer_results
            .iter()
            .any(|p| p.layer == 1 && p.location == HookPoint::ResidPost));
        assert!(report
            .layer_results
            .iter()
            .all(|p| p.results.accuracy <= report.best_accuracy));
    }

    #[test]
    fn test_out_of_range_layer() {
        let mut cfg = tiny_experiment();
        cfg.probe.layers = vec![5];
        let exp = Experiment::new(cfg, Device::Cpu).unwrap();
        let model = exp.build_model().unwrap();
        assert!(exp.probe(&model).is_err());
    }

    #[test]
    #[should_panic(expected = "outside {1, 2}")]
    fn test_three_state_language_halts_probing() {
        let mut cfg = tiny_experiment();
        // Counts A modulo 3
        cfg.regex = "((B|C)*A(B|C)*A(B|C)*A)*(B|C)*".to_string();
        let exp = Experiment::new(cfg, Device::Cpu).unwrap();
        let model = exp.build_model().unwrap();
        let _ = exp.probe(&model);
    }

    #[test]
    fn test_run_trains_then_loads() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("w.safetensors");
        let exp = Experiment::new(tiny_experiment(), Device::Cpu).unwrap();

        let first = exp.run(&weights, false).unwrap();
        assert_eq!(first.training.as_ref().map(TrainingReport::steps), Some(3));
        assert!(weights.exists());
        assert_eq!(first.generation.report.n_samples(), 12);
        assert_eq!(first.generation.data_even_fraction, 1.0);

        let second = exp.run(&weights, false).unwrap();
        assert!(second.training.is_none());
        assert_eq!(second.generation.report.strings, first.generation.report.strings);
    }

    #[test]
    fn test_invalid_regex() {
        let cfg = ExperimentConfig {
            regex: "(A|B".to_string(),
            ..tiny_experiment()
        };
        assert!(Experiment::new(cfg, Device::Cpu).is_err());
    }
}
