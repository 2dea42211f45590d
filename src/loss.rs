//! Next-token cross-entropy
//!
//! Logits at position `p` predict the token at `p + 1`; the final position
//! has no target and is dropped.

use anyhow::{ensure, Result};
use candle_core::{DType, Tensor, D};

fn shifted(logits: &Tensor, tokens: &Tensor) -> Result<(Tensor, Tensor, usize, usize)> {
    let (b, p, v) = logits.dims3()?;
    let (tb, tp) = tokens.dims2()?;
    ensure!(
        (b, p) == (tb, tp),
        "Logits cover ({b}, {p}) positions but tokens are ({tb}, {tp})"
    );
    ensure!(p >= 2, "Need at least two positions for a next-token loss, got {p}");

    let preds = logits.narrow(1, 0, p - 1)?.reshape((b * (p - 1), v))?;
    let targets = tokens
        .narrow(1, 1, p - 1)?
        .to_dtype(DType::U32)?
        .flatten_all()?;
    Ok((preds, targets, b, p - 1))
}

/// Mean next-token cross-entropy as a scalar tensor
pub fn next_token_loss(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (preds, targets, _, _) = shifted(logits, tokens)?;
    Ok(candle_nn::loss::cross_entropy(&preds, &targets)?)
}

/// Cross-entropy of every predicted position: `(batch, pos - 1)`
pub fn per_token_loss(logits: &Tensor, tokens: &Tensor) -> Result<Tensor> {
    let (preds, targets, b, n) = shifted(logits, tokens)?;
    let log_probs = candle_nn::ops::log_softmax(&preds, D::Minus1)?;
    let picked = log_probs.gather(&targets.unsqueeze(1)?, 1)?;
    Ok(picked.neg()?.reshape((b, n))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn one_hot_logits(tokens: &[Vec<u32>], vocab: usize, scale: f32) -> Tensor {
        // Position p puts all its mass on tokens[p + 1]
        let mut data = Vec::new();
        for row in tokens {
            for p in 0..row.len() {
                let target = row.get(p + 1).copied().unwrap_or(0) as usize;
                data.extend((0..vocab).map(|v| if v == target { scale } else { 0.0 }));
            }
        }
        Tensor::from_vec(data, (tokens.len(), tokens[0].len(), vocab), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_uniform_logits_give_log_vocab() {
        let logits = Tensor::zeros((2, 5, 16), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::zeros((2, 5), DType::U32, &Device::Cpu).unwrap();
        let loss: f32 = next_token_loss(&logits, &tokens).unwrap().to_scalar().unwrap();
        assert!((loss - (16f32).ln()).abs() < 1e-5);
    }

    #[test]
    fn test_confident_correct_prediction() {
        let rows = vec![vec![0u32, 3, 1, 2], vec![0, 1, 1, 3]];
        let logits = one_hot_logits(&rows, 4, 30.0);
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        let tokens = Tensor::from_vec(flat, (2, 4), &Device::Cpu).unwrap();
        let loss: f32 = next_token_loss(&logits, &tokens).unwrap().to_scalar().unwrap();
        assert!(loss < 1e-6);
    }

    #[test]
    fn test_per_token_matches_mean() {
        let data: Vec<f32> = (0..2 * 4 * 5).map(|i| ((i * 7) % 11) as f32 * 0.3).collect();
        let logits = Tensor::from_vec(data, (2, 4, 5), &Device::Cpu).unwrap();
        let tokens = Tensor::from_vec(vec![0u32, 1, 2, 3, 4, 0, 1, 2], (2, 4), &Device::Cpu)
            .unwrap();

        let per = per_token_loss(&logits, &tokens).unwrap();
        assert_eq!(per.dims(), &[2, 3]);
        let mean: f32 = per.mean_all().unwrap().to_scalar().unwrap();
        let loss: f32 = next_token_loss(&logits, &tokens).unwrap().to_scalar().unwrap();
        assert!((mean - loss).abs() < 1e-5);
    }

    #[test]
    fn test_trailing_position_is_ignored() {
        let data: Vec<f32> = (0..4 * 6).map(|i| ((i * 5) % 7) as f32 * 0.4).collect();
        let long = Tensor::from_vec(data, (1, 4, 6), &Device::Cpu).unwrap();
        let long_tokens = Tensor::from_vec(vec![0u32, 2, 5, 1], (1, 4), &Device::Cpu).unwrap();
        let short = long.narrow(1, 0, 3).unwrap();
        let short_tokens = long_tokens.narrow(1, 0, 3).unwrap();

        let long_loss: Vec<Vec<f32>> = per_token_loss(&long, &long_tokens)
            .unwrap()
            .to_vec2()
            .unwrap();
        let short_loss: Vec<Vec<f32>> = per_token_loss(&short, &short_tokens)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(&long_loss[0][..2], &short_loss[0][..]);
    }

    #[test]
    fn test_rejects_short_or_mismatched() {
        let logits = Tensor::zeros((1, 1, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::zeros((1, 1), DType::U32, &Device::Cpu).unwrap();
        assert!(next_token_loss(&logits, &tokens).is_err());

        let logits = Tensor::zeros((1, 3, 4), DType::F32, &Device::Cpu).unwrap();
        let tokens = Tensor::zeros((1, 4), DType::U32, &Device::Cpu).unwrap();
        assert!(next_token_loss(&logits, &tokens).is_err());
    }
}
