//! Causal attention masks
//!
//! Masks are additive: `0.0` where a query may attend to a key and `-inf`
//! elsewhere. They are cached by `(query_len, key_len, offset, device,
//! dtype)`; a cached tensor is handed out as a shallow clone.

use anyhow::{anyhow, Result};
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

type MaskKey = (usize, usize, usize, usize, DType);

static MASK_CACHE: LazyLock<Mutex<HashMap<MaskKey, Tensor>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Simplified device identifier: one device per backend type
fn device_id(device: &Device) -> usize {
    match device {
        Device::Cpu => 0,
        Device::Cuda(_) => 1,
        Device::Metal(_) => 2,
    }
}

/// Mask of shape `[1, 1, query_len, key_len]` where query `i` sits at
/// absolute position `offset + i` and may see keys `0..=offset + i`
///
/// # Example
///
/// `causal_mask(2, 4, 2, ..)` (two new queries after two cached keys):
/// ```text
/// [[[[0, 0, 0, -inf],
///    [0, 0, 0,    0]]]]
/// ```
pub fn causal_mask(
    query_len: usize,
    key_len: usize,
    offset: usize,
    device: &Device,
    dtype: DType,
) -> Result<Tensor> {
    anyhow::ensure!(
        offset + query_len <= key_len,
        "Queries end at {} but only {key_len} keys are available",
        offset + query_len
    );
    let key = (query_len, key_len, offset, device_id(device), dtype);
    {
        let cache = MASK_CACHE.lock().map_err(|_| anyhow!("mask cache poisoned"))?;
        if let Some(cached) = cache.get(&key) {
            return Ok(cached.clone());
        }
    }

    let mask: Vec<f32> = (0..query_len)
        .flat_map(|i| {
            let visible_up_to = offset + i;
            (0..key_len).map(move |j| {
                if j <= visible_up_to {
                    0.0
                } else {
                    f32::NEG_INFINITY
                }
            })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (1, 1, query_len, key_len), device)?.to_dtype(dtype)?;

    MASK_CACHE
        .lock()
        .map_err(|_| anyhow!("mask cache poisoned"))?
        .insert(key, mask.clone());
    Ok(mask)
}

/// Square causal mask for a full forward pass
pub fn create_causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    causal_mask(seq_len, seq_len, 0, device, dtype)
}
