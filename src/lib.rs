// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `head`/`heads`
#![allow(clippy::module_name_repetitions)] // ProbeResults in probe.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::unused_self)] // &self for API consistency
#![allow(clippy::trivially_copy_pass_by_ref)] // &usize for API consistency
#![allow(clippy::struct_field_names)] // field postfix patterns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::unnecessary_wraps)] // Result for future error handling
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! parity-probe: does a small transformer track parity internally?
//!
//! Trains a small transformer on words of a regular language (by default
//! the words with an even number of `A`s over `{A, B, C}`), checks the
//! parity of `A` in sampled continuations, and fits linear probes on the
//! residual stream to see where the automaton state becomes linearly
//! readable.
//!
//! ## Architecture
//!
//! - `regex`: Regex parser and Thompson NFA
//! - `dfa`: Minimal DFA compilation, state traces and Graphviz output
//! - `sampler`: Uniform sampling of accepted words with aligned state labels
//! - `tokens`: Byte-level token helpers
//! - `config`: Model, training, generation and probe configuration
//! - `model`: ParityTransformer forward pass with activation capture hooks
//! - `cache`: ActivationCache for storing layer activations
//! - `kv_cache`: KV-cache for efficient autoregressive generation
//! - `masks`: Shared causal mask utilities
//! - `loss`: Next-token cross-entropy
//! - `train`: AdamW training loop with warmup and gradient clipping
//! - `checkpoint`: Safetensors weight files
//! - `generate`: Sampling and the parity check on generated words
//! - `probe`: Linear probing with linfa
//! - `experiment`: Experiment runner coordinating the full pipeline

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod dfa;
pub mod experiment;
pub mod generate;
pub mod kv_cache;
pub mod loss;
pub mod masks;
pub mod model;
pub mod probe;
pub mod regex;
pub mod sampler;
pub mod tokens;
pub mod train;

pub use cache::{ActivationCache, HookPoint};
pub use checkpoint::{list_tensors, load_weights, save_weights, DEFAULT_WEIGHTS_FILE};
pub use config::{
    ActivationFn, ExperimentConfig, GenerationConfig, ModelConfig, NormalizationType, ProbeConfig,
    TrainConfig, PARITY_REGEX,
};
pub use dfa::{Dfa, DEAD_STATE};
pub use experiment::{
    assert_binary_states, Experiment, ExperimentResults, GenerationSummary, LayerProbe, ProbeReport,
};
pub use generate::{generate, sample_from_logits, GenerationReport, ParityCounts, ZTest};
pub use kv_cache::KVCache;
pub use loss::{next_token_loss, per_token_loss};
pub use masks::{causal_mask, create_causal_mask};
pub use model::{select_device, ParityTransformer};
pub use probe::{ProbeResults, ProbeTrainer};
pub use regex::Regex;
pub use sampler::{DfaGenerator, DfaSampler, LabeledBatch, LengthMode};
pub use train::{Trainer, TrainingReport, WarmupSchedule};
