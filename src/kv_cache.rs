//! KV-cache for autoregressive sampling
//!
//! Each layer stores keys and values of every position processed so far,
//! shaped `[batch, n_heads, seq_len, d_head]`, so a sampling step only runs
//! the newest token through the model.

use candle_core::Tensor;

#[derive(Debug, Clone)]
pub struct KVCache {
    /// Cached key tensors per layer: [batch, n_heads, seq_len, d_head]
    pub keys: Vec<Option<Tensor>>,
    /// Cached value tensors per layer: [batch, n_heads, seq_len, d_head]
    pub values: Vec<Option<Tensor>>,
}

impl KVCache {
    /// Create a new empty cache for the given number of layers
    pub fn new(n_layers: usize) -> Self {
        Self {
            keys: vec![None; n_layers],
            values: vec![None; n_layers],
        }
    }

    /// Number of positions already processed (0 if empty)
    pub fn seq_len(&self) -> usize {
        self.keys
            .iter()
            .find_map(|k| k.as_ref())
            .map_or(0, |k| k.dim(2).unwrap_or(0))
    }

    /// Mutable (key, value) slots of one layer
    pub fn layer_mut(&mut self, layer: usize) -> (&mut Option<Tensor>, &mut Option<Tensor>) {
        (&mut self.keys[layer], &mut self.values[layer])
    }

    /// Bytes held by all cached tensors
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(&self.values)
            .flatten()
            .map(|t| t.elem_count() * t.dtype().size_in_bytes())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_new_cache() {
        let cache = KVCache::new(4);
        assert_eq!(cache.keys.len(), 4);
        assert_eq!(cache.seq_len(), 0);
        assert_eq!(cache.memory_usage(), 0);
    }

    #[test]
    fn test_fill_layer() {
        let mut cache = KVCache::new(2);
        let k = Tensor::zeros((3, 2, 5, 8), DType::F32, &Device::Cpu).unwrap();
        {
            let (key, value) = cache.layer_mut(1);
            *key = Some(k.clone());
            *value = Some(k);
        }
        assert_eq!(cache.seq_len(), 5);
        assert_eq!(cache.memory_usage(), 2 * 3 * 2 * 5 * 8 * 4);
    }
}
