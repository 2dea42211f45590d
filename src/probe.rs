//! Linear probing with linfa
//!
//! Logistic-regression probes read the automaton state (even/odd) off
//! flattened residual activations. By default a probe is scored on the
//! data it was fitted on, which measures whether the state is linearly
//! representable; `train_ratio` switches to a held-out split.

use anyhow::{ensure, Context, Result};
use candle_core::{DType, Tensor};
use linfa::prelude::*;
use linfa_logistic::{FittedLogisticRegression, LogisticRegression};
use ndarray::{Array1, Array2, Axis};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Results from fitting and scoring a probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeResults {
    /// Classification accuracy on the scored samples
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
    /// Odd-state rows (label 1) are the positive class
    pub true_positives: usize,
    pub true_negatives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
}

impl ProbeResults {
    pub fn precision(&self) -> f64 {
        let denom = self.true_positives + self.false_positives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn recall(&self) -> f64 {
        let denom = self.true_positives + self.false_negatives;
        if denom == 0 {
            0.0
        } else {
            self.true_positives as f64 / denom as f64
        }
    }

    pub fn f1(&self) -> f64 {
        let p = self.precision();
        let r = self.recall();
        if p + r == 0.0 {
            0.0
        } else {
            2.0 * p * r / (p + r)
        }
    }
}

/// Convert a 2-D tensor to an `f64` ndarray
pub fn tensor_to_array2(tensor: &Tensor) -> Result<Array2<f64>> {
    let (rows, cols) = tensor.dims2()?;
    let flat: Vec<f64> = tensor
        .to_dtype(DType::F64)?
        .flatten_all()?
        .to_vec1()?;
    Array2::from_shape_vec((rows, cols), flat).context("Failed to create feature matrix")
}

/// Trainer for linear probes
pub struct ProbeTrainer {
    max_iterations: u64,
}

impl ProbeTrainer {
    pub fn new(max_iterations: u64) -> Self {
        Self { max_iterations }
    }

    fn fit(
        &self,
        x: Array2<f64>,
        y: Array1<usize>,
    ) -> Result<FittedLogisticRegression<f64, usize>> {
        ensure!(x.nrows() > 0, "Empty dataset");
        ensure!(
            x.nrows() == y.len(),
            "{} feature rows but {} labels",
            x.nrows(),
            y.len()
        );
        debug!("Fitting probe: {} samples, {} features", x.nrows(), x.ncols());

        LogisticRegression::default()
            .max_iterations(self.max_iterations)
            .fit(&Dataset::new(x, y))
            .context("Failed to train logistic regression")
    }

    /// Fit on `(x, y)` and report accuracy on the same samples
    pub fn fit_and_score(&self, x: Array2<f64>, y: Array1<usize>) -> Result<ProbeResults> {
        let model = self.fit(x.clone(), y.clone())?;
        Ok(compute_metrics(&model.predict(&x), &y))
    }

    /// Fit on the training split and score on the test split
    pub fn train_and_evaluate(
        &self,
        train: (Array2<f64>, Array1<usize>),
        test: (Array2<f64>, Array1<usize>),
    ) -> Result<ProbeResults> {
        let (test_x, test_y) = test;
        ensure!(test_x.nrows() > 0, "Empty test split");
        let model = self.fit(train.0, train.1)?;
        Ok(compute_metrics(&model.predict(&test_x), &test_y))
    }

    /// Shuffle rows with `seed` and hold out `1 - train_ratio` of them
    pub fn split_and_evaluate(
        &self,
        x: Array2<f64>,
        y: Array1<usize>,
        train_ratio: f64,
        seed: u64,
    ) -> Result<ProbeResults> {
        let (train_idx, test_idx) = split_indices(x.nrows(), train_ratio, seed);
        ensure!(
            !train_idx.is_empty() && !test_idx.is_empty(),
            "train_ratio {train_ratio} leaves an empty split of {} rows",
            x.nrows()
        );
        let train = (x.select(Axis(0), &train_idx), y.select(Axis(0), &train_idx));
        let test = (x.select(Axis(0), &test_idx), y.select(Axis(0), &test_idx));
        self.train_and_evaluate(train, test)
    }
}

impl Default for ProbeTrainer {
    fn default() -> Self {
        Self::new(1000)
    }
}

/// Seeded shuffle of `0..n` cut at `n * train_ratio`
pub fn split_indices(n: usize, train_ratio: f64, seed: u64) -> (Vec<usize>, Vec<usize>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut indices: Vec<usize> = (0..n).collect();
    indices.shuffle(&mut rng);
    let split_idx = (n as f64 * train_ratio) as usize;
    let test = indices.split_off(split_idx);
    (indices, test)
}

fn compute_metrics(predictions: &Array1<usize>, labels: &Array1<usize>) -> ProbeResults {
    let mut tp = 0;
    let mut tn = 0;
    let mut fp = 0;
    let mut r#fn = 0;

    for (pred, label) in predictions.iter().zip(labels.iter()) {
        match (*pred, *label) {
            (1, 1) => tp += 1,
            (0, 0) => tn += 1,
            (1, 0) => fp += 1,
            (0, 1) => r#fn += 1,
            _ => {}
        }
    }

    let correct = tp + tn;
    let total = predictions.len();
    let accuracy = if total == 0 {
        0.0
    } else {
        correct as f64 / total as f64
    };

    ProbeResults {
        accuracy,
        correct,
        total,
        true_positives: tp,
        true_negatives: tn,
        false_positives: fp,
        false_negatives: r#fn,
    }
}
