//! Experiment configuration
//!
//! Every section has defaults reproducing the reference parity experiment,
//! so a JSON config file only needs to name the fields it overrides.

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::cache::HookPoint;
use crate::sampler::LengthMode;
use crate::tokens::BYTE_VOCAB;

/// Regex whose minimal DFA tracks the parity of `A` occurrences
pub const PARITY_REGEX: &str = "((B|C)*AB*A)*(B|C)*";

/// Activation function used inside the MLP blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationFn {
    /// Exact (erf) GELU
    Gelu,
    /// Tanh-approximated GELU
    GeluNew,
    Relu,
    Silu,
}

/// Normalization applied before attention, MLP and unembedding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NormalizationType {
    /// LayerNorm with learned gain and bias
    #[serde(rename = "LN")]
    LayerNorm,
    /// RMSNorm with learned gain
    #[serde(rename = "RMS")]
    RmsNorm,
    /// No normalization
    #[serde(rename = "none")]
    Identity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionalEmbeddingType {
    /// Learned absolute position embeddings
    Standard,
    Rotary,
}

/// Transformer architecture hyperparameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_model: usize,
    pub d_head: usize,
    pub n_heads: usize,
    pub d_mlp: usize,
    pub n_layers: usize,
    pub d_vocab: usize,
    pub d_vocab_out: usize,
    pub n_ctx: usize,
    pub act_fn: ActivationFn,
    pub normalization_type: NormalizationType,
    pub eps: f64,
    /// Std of the normal GPT-2 initialization; biases start at zero
    pub initializer_range: f64,
    pub attn_only: bool,
    pub use_attn_scale: bool,
    pub positional_embedding_type: PositionalEmbeddingType,
    /// Seed for parameter initialization
    pub seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 128,
            d_head: 32,
            n_heads: 4,
            d_mlp: 512,
            n_layers: 4,
            d_vocab: BYTE_VOCAB,
            d_vocab_out: BYTE_VOCAB,
            n_ctx: 32,
            act_fn: ActivationFn::Gelu,
            normalization_type: NormalizationType::LayerNorm,
            eps: 1e-5,
            initializer_range: 0.035_355_339_059_327_376,
            attn_only: false,
            use_attn_scale: true,
            positional_embedding_type: PositionalEmbeddingType::Standard,
            seed: 0,
        }
    }
}

impl ModelConfig {
    /// Reject configurations the model cannot be built from
    pub fn validate(&self) -> Result<()> {
        ensure!(self.d_model > 0, "d_model must be positive");
        ensure!(self.d_head > 0, "d_head must be positive");
        ensure!(self.n_heads > 0, "n_heads must be positive");
        ensure!(self.n_layers > 0, "n_layers must be positive");
        ensure!(self.d_vocab > 0, "d_vocab must be positive");
        ensure!(self.d_vocab_out > 0, "d_vocab_out must be positive");
        ensure!(self.n_ctx > 1, "n_ctx must be at least 2, got {}", self.n_ctx);
        ensure!(
            self.attn_only || self.d_mlp > 0,
            "d_mlp must be positive unless attn_only is set"
        );
        ensure!(
            self.initializer_range > 0.0 && self.initializer_range.is_finite(),
            "initializer_range must be positive, got {}",
            self.initializer_range
        );
        ensure!(self.eps > 0.0, "eps must be positive, got {}", self.eps);
        ensure!(
            self.positional_embedding_type == PositionalEmbeddingType::Standard,
            "positional_embedding_type {:?} is not supported",
            self.positional_embedding_type
        );
        Ok(())
    }

    /// Weight elements in the transformer blocks (embeddings, norms and
    /// biases excluded)
    pub fn n_params(&self) -> usize {
        let attn = 4 * self.d_model * self.d_head * self.n_heads;
        let mlp = if self.attn_only {
            0
        } else {
            2 * self.d_model * self.d_mlp
        };
        self.n_layers * (attn + mlp)
    }
}

/// Optimizer, schedule and loop settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Number of optimizer steps; the loop runs steps `0..num_steps`
    pub num_steps: usize,
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub weight_decay: f64,
    /// Global gradient-norm clip, `None` disables clipping
    pub max_grad_norm: Option<f64>,
    /// Linear warmup length; step `i` uses `lr * min(i / warmup_steps, 1)`
    pub warmup_steps: usize,
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            num_steps: 10_000,
            learning_rate: 1e-4,
            beta1: 0.9,
            beta2: 0.95,
            weight_decay: 0.1,
            max_grad_norm: Some(1.0),
            warmup_steps: 100,
            log_every: 100,
        }
    }
}

/// Sampling settings for the post-training parity check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Number of all-zero single-token seeds
    pub n_samples: usize,
    pub max_new_tokens: usize,
    /// Softmax temperature; `<= 0` means greedy decoding
    pub temperature: f32,
    pub eos_token_id: Option<u32>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            n_samples: 1000,
            max_new_tokens: 31,
            temperature: 1.0,
            eos_token_id: Some(0),
        }
    }
}

/// Linear probe settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Number of sequences in the probing batch
    pub n_sequences: usize,
    /// Layer indices to probe (empty = all layers)
    pub layers: Vec<usize>,
    /// Residual tap points probed at every layer
    pub locations: Vec<HookPoint>,
    pub max_iterations: u64,
    /// Fraction of samples used for fitting when evaluating on a held-out
    /// split. `None` scores the probe on its own fitting data.
    pub train_ratio: Option<f64>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            n_sequences: 5000,
            layers: vec![],
            locations: vec![HookPoint::ResidMid, HookPoint::ResidPost],
            max_iterations: 1000,
            train_ratio: None,
        }
    }
}

/// Top-level experiment configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Regular expression describing the training language
    pub regex: String,
    /// Symbol whose occurrence parity is checked on generated samples
    pub target_symbol: char,
    /// Word length of training and probing sequences (`None` = n_ctx - 1)
    pub word_len: Option<usize>,
    pub length_mode: LengthMode,
    /// Seed for data sampling, generation and probe splits
    pub seed: u64,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub generation: GenerationConfig,
    pub probe: ProbeConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            regex: PARITY_REGEX.to_string(),
            target_symbol: 'A',
            word_len: None,
            length_mode: LengthMode::Exact,
            seed: 123,
            model: ModelConfig::default(),
            train: TrainConfig::default(),
            generation: GenerationConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}

impl ExperimentConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.model.validate()?;
        ensure!(
            self.target_symbol.is_ascii() && self.target_symbol != '\0',
            "target_symbol must be a non-zero ASCII character"
        );
        let word_len = self.word_len();
        ensure!(
            word_len < self.model.n_ctx,
            "word_len {word_len} does not fit in n_ctx {} (one slot is the seed token)",
            self.model.n_ctx
        );
        ensure!(self.train.batch_size > 0, "batch_size must be positive");
        ensure!(self.probe.n_sequences > 0, "probe.n_sequences must be positive");
        ensure!(!self.probe.locations.is_empty(), "probe.locations is empty");
        for location in &self.probe.locations {
            ensure!(
                location.is_residual_width(),
                "probe location {location} is not a residual activation"
            );
        }
        if let Some(ratio) = self.probe.train_ratio {
            ensure!(
                ratio > 0.0 && ratio < 1.0,
                "probe.train_ratio must be in (0, 1), got {ratio}"
            );
        }
        Ok(())
    }

    /// Effective word length
    pub fn word_len(&self) -> usize {
        self.word_len.unwrap_or(self.model.n_ctx - 1)
    }

    /// Target symbol as a byte
    pub fn target_byte(&self) -> u8 {
        self.target_symbol as u8
    }
}
