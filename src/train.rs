//! Training loop: AdamW with linear warmup and global gradient clipping

use anyhow::{bail, Result};
use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{debug, info};

use crate::config::TrainConfig;
use crate::loss::next_token_loss;
use crate::model::ParityTransformer;
use crate::sampler::LabeledBatch;

/// Linear warmup to a constant learning rate
#[derive(Debug, Clone, Copy)]
pub struct WarmupSchedule {
    pub base_lr: f64,
    pub warmup_steps: usize,
}

impl WarmupSchedule {
    pub fn new(base_lr: f64, warmup_steps: usize) -> Self {
        Self {
            base_lr,
            warmup_steps,
        }
    }

    /// `base_lr * min(step / warmup_steps, 1)`; step 0 has a zero rate
    pub fn lr_at(&self, step: usize) -> f64 {
        if self.warmup_steps == 0 {
            return self.base_lr;
        }
        let factor = (step as f64 / self.warmup_steps as f64).min(1.0);
        self.base_lr * factor
    }
}

/// Global L2 norm over every gradient present for `vars`
pub fn grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f64> {
    let mut sum_sq = 0.0;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    Ok(sum_sq.sqrt())
}

/// Rescale gradients in place so their global norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let total = grad_norm(grads, vars)?;
    let coef = max_norm / (total + 1e-6);
    if coef < 1.0 {
        for var in vars {
            let scaled = match grads.get(var.as_tensor()) {
                Some(grad) => (grad * coef)?,
                None => continue,
            };
            grads.insert(var.as_tensor(), scaled);
        }
    }
    Ok(total)
}

/// Loss curve and bookkeeping of one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Mean next-token loss of every step
    pub losses: Vec<f32>,
    /// Gradient norm before clipping, per step
    pub grad_norms: Vec<f64>,
    pub n_params: usize,
    pub elapsed_secs: f64,
}

impl TrainingReport {
    pub fn steps(&self) -> usize {
        self.losses.len()
    }

    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }

    /// Mean of the last `window` losses
    pub fn recent_mean(&self, window: usize) -> Option<f32> {
        let window = window.min(self.losses.len());
        if window == 0 {
            return None;
        }
        let tail = &self.losses[self.losses.len() - window..];
        Some(tail.iter().sum::<f32>() / window as f32)
    }
}

pub struct Trainer {
    config: TrainConfig,
}

impl Trainer {
    pub fn new(config: TrainConfig) -> Self {
        Self { config }
    }

    /// Run `num_steps` optimizer steps, pulling one batch per step
    pub fn train<I>(&self, model: &ParityTransformer, batches: I) -> Result<TrainingReport>
    where
        I: IntoIterator<Item = Result<LabeledBatch>>,
    {
        let cfg = &self.config;
        let vars = model.varmap().all_vars();
        let n_params = model.n_parameters();
        let mut optimizer = AdamW::new(
            vars.clone(),
            ParamsAdamW {
                lr: cfg.learning_rate,
                beta1: cfg.beta1,
                beta2: cfg.beta2,
                eps: 1e-8,
                weight_decay: cfg.weight_decay,
            },
        )?;
        let schedule = WarmupSchedule::new(cfg.learning_rate, cfg.warmup_steps);

        info!(
            "Training {} parameters for {} steps (batch {}, lr {:.1e})",
            n_params, cfg.num_steps, cfg.batch_size, cfg.learning_rate
        );

        let start = Instant::now();
        let mut losses = Vec::with_capacity(cfg.num_steps);
        let mut grad_norms = Vec::with_capacity(cfg.num_steps);

        for (step, batch) in batches.into_iter().take(cfg.num_steps).enumerate() {
            let batch = batch?;
            let lr = schedule.lr_at(step);
            optimizer.set_learning_rate(lr);

            let tokens = batch.tokens_tensor(model.device())?;
            let logits = model.forward(&tokens)?;
            let loss = next_token_loss(&logits, &tokens)?;
            let loss_value = loss.to_scalar::<f32>()?;
            if !loss_value.is_finite() {
                bail!("Loss became {loss_value} at step {step}");
            }

            let mut grads = loss.backward()?;
            let norm = match cfg.max_grad_norm {
                Some(max_norm) => clip_grad_norm(&mut grads, &vars, max_norm)?,
                None => grad_norm(&grads, &vars)?,
            };
            optimizer.step(&grads)?;

            losses.push(loss_value);
            grad_norms.push(norm);

            if cfg.log_every > 0 && step % cfg.log_every == 0 {
                info!("step {step:>6}: loss {loss_value:.4}, lr {lr:.2e}, grad norm {norm:.3}");
            } else {
                debug!("step {step}: loss {loss_value:.4}");
            }
        }

        if losses.len() < cfg.num_steps {
            bail!(
                "Batch stream ended after {} of {} steps",
                losses.len(),
                cfg.num_steps
            );
        }

        let report = TrainingReport {
            losses,
            grad_norms,
            n_params,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };
        info!(
            "Training done in {:.1}s, final loss {:.4}",
            report.elapsed_secs,
            report.final_loss().unwrap_or(f32::NAN)
        );
        Ok(report)
    }
}
