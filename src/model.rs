//! Small pre-norm transformer with activation hooks
//!
//! Architecture (per block `l`):
//!
//! ```text
//! resid_pre[0]  = W_E[tokens] + W_pos[positions]
//! resid_mid[l]  = resid_pre[l] + attn(ln1(resid_pre[l]))
//! resid_post[l] = resid_mid[l] + mlp(ln2(resid_mid[l]))
//! logits        = W_U ln_final(resid_post[last]) + b_U
//! ```
//!
//! Parameters live in a [`VarMap`] so the same model can be trained with a
//! candle optimizer, saved to safetensors and reloaded in place. Norms and
//! softmax are written with elementary tensor ops so every path is
//! differentiable.

use anyhow::{anyhow, Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use rand::distributions::Distribution;
use rand::rngs::StdRng;
use rand::SeedableRng;
use statrs::distribution::Normal;
use tracing::{debug, info};

use crate::cache::{ActivationCache, HookPoint};
use crate::config::{ActivationFn, ModelConfig, NormalizationType};
use crate::kv_cache::KVCache;
use crate::masks::{causal_mask, create_causal_mask};

/// Pick CUDA when available unless `force_cpu` is set
pub fn select_device(force_cpu: bool) -> Device {
    if force_cpu {
        info!("Forcing CPU mode");
        return Device::Cpu;
    }
    match Device::cuda_if_available(0) {
        Ok(dev) if dev.is_cuda() => {
            info!("Using CUDA device");
            dev
        }
        _ => {
            info!("CUDA not available, using CPU");
            Device::Cpu
        }
    }
}

/// Seeded GPT-2 style initializer writing straight into the `VarMap`
struct ParamInit<'a> {
    varmap: &'a VarMap,
    rng: StdRng,
    normal: Normal,
}

impl<'a> ParamInit<'a> {
    fn new(varmap: &'a VarMap, std: f64, seed: u64) -> Result<Self> {
        Ok(Self {
            varmap,
            rng: StdRng::seed_from_u64(seed),
            normal: Normal::new(0.0, std).map_err(|e| anyhow!("Invalid init std {std}: {e}"))?,
        })
    }

    /// Weight matrix drawn from `N(0, initializer_range)`
    fn normal(&mut self, vb: &VarBuilder, shape: (usize, usize), name: &str) -> Result<Tensor> {
        let tensor = vb.get_with_hints(shape, name, Init::Const(0.0))?;
        let data: Vec<f32> = (0..shape.0 * shape.1)
            .map(|_| self.normal.sample(&mut self.rng) as f32)
            .collect();
        let values = Tensor::from_vec(data, shape, tensor.device())?;

        let prefix = vb.prefix();
        let path = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}.{name}")
        };
        let vars = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("VarMap lock poisoned"))?;
        vars.get(&path)
            .with_context(|| format!("Parameter {path} missing after creation"))?
            .set(&values)?;
        Ok(tensor)
    }

    fn constant(&self, vb: &VarBuilder, size: usize, name: &str, value: f64) -> Result<Tensor> {
        Ok(vb.get_with_hints(size, name, Init::Const(value))?)
    }

    fn linear(&mut self, vb: VarBuilder, in_dim: usize, out_dim: usize) -> Result<Linear> {
        let weight = self.normal(&vb, (out_dim, in_dim), "weight")?;
        let bias = self.constant(&vb, out_dim, "bias", 0.0)?;
        Ok(Linear::new(weight, Some(bias)))
    }

    fn norm(&self, vb: VarBuilder, config: &ModelConfig) -> Result<Option<Norm>> {
        let size = config.d_model;
        Ok(match config.normalization_type {
            NormalizationType::LayerNorm => Some(Norm {
                weight: self.constant(&vb, size, "weight", 1.0)?,
                bias: Some(self.constant(&vb, size, "bias", 0.0)?),
                eps: config.eps,
                center: true,
            }),
            NormalizationType::RmsNorm => Some(Norm {
                weight: self.constant(&vb, size, "weight", 1.0)?,
                bias: None,
                eps: config.eps,
                center: false,
            }),
            NormalizationType::Identity => None,
        })
    }
}

/// LayerNorm (`center`) or RMSNorm, built from differentiable primitives
struct Norm {
    weight: Tensor,
    bias: Option<Tensor>,
    eps: f64,
    center: bool,
}

impl Norm {
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = if self.center {
            x.broadcast_sub(&x.mean_keepdim(D::Minus1)?)?
        } else {
            x.clone()
        };
        let scale = x.sqr()?.mean_keepdim(D::Minus1)?.affine(1.0, self.eps)?.sqrt()?;
        let x = x.broadcast_div(&scale)?.broadcast_mul(&self.weight)?;
        match &self.bias {
            Some(bias) => Ok(x.broadcast_add(bias)?),
            None => Ok(x),
        }
    }
}

fn apply_norm(norm: Option<&Norm>, x: &Tensor) -> Result<Tensor> {
    match norm {
        Some(norm) => norm.forward(x),
        None => Ok(x.clone()),
    }
}

/// Causal multi-head self-attention
struct Attention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    n_heads: usize,
    d_head: usize,
    scale: f64,
}

impl Attention {
    fn load(vb: VarBuilder, init: &mut ParamInit, config: &ModelConfig) -> Result<Self> {
        let inner = config.n_heads * config.d_head;
        Ok(Self {
            q_proj: init.linear(vb.pp("q_proj"), config.d_model, inner)?,
            k_proj: init.linear(vb.pp("k_proj"), config.d_model, inner)?,
            v_proj: init.linear(vb.pp("v_proj"), config.d_model, inner)?,
            o_proj: init.linear(vb.pp("o_proj"), inner, config.d_model)?,
            n_heads: config.n_heads,
            d_head: config.d_head,
            scale: if config.use_attn_scale {
                1.0 / (config.d_head as f64).sqrt()
            } else {
                1.0
            },
        })
    }

    /// Project to `(batch, heads, seq, d_head)` queries, keys and values
    fn project(&self, x: &Tensor) -> Result<(Tensor, Tensor, Tensor)> {
        let (b, seq_len, _) = x.dims3()?;
        let split = |t: Tensor| -> Result<Tensor> {
            Ok(t.reshape((b, seq_len, self.n_heads, self.d_head))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        Ok((
            split(self.q_proj.forward(x)?)?,
            split(self.k_proj.forward(x)?)?,
            split(self.v_proj.forward(x)?)?,
        ))
    }

    /// Returns the projected output and the attention pattern
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: &Tensor,
    ) -> Result<(Tensor, Tensor)> {
        let (b, _, seq_len, _) = q.dims4()?;
        let scores = (q.matmul(&k.transpose(2, 3)?.contiguous()?)? * self.scale)?;
        let scores = scores.broadcast_add(mask)?;
        let pattern = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let z = pattern.matmul(v)?;
        let z = z.transpose(1, 2)?.reshape((b, seq_len, ()))?;
        Ok((self.o_proj.forward(&z)?, pattern))
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<(Tensor, Tensor)> {
        let (q, k, v) = self.project(x)?;
        self.attend(&q, &k, &v, mask)
    }

    fn forward_with_kv_cache(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache_k: &mut Option<Tensor>,
        cache_v: &mut Option<Tensor>,
    ) -> Result<Tensor> {
        let (q, k, v) = self.project(x)?;
        let (k, v) = match (cache_k.as_ref(), cache_v.as_ref()) {
            (Some(prev_k), Some(prev_v)) => (
                Tensor::cat(&[prev_k, &k], 2)?.contiguous()?,
                Tensor::cat(&[prev_v, &v], 2)?.contiguous()?,
            ),
            _ => (k, v),
        };
        *cache_k = Some(k.clone());
        *cache_v = Some(v.clone());

        let query_len = q.dim(2)?;
        let key_len = k.dim(2)?;
        let mask = causal_mask(query_len, key_len, start_pos, x.device(), x.dtype())?;
        let (out, _) = self.attend(&q, &k, &v, &mask)?;
        Ok(out)
    }
}

/// Two-layer MLP with a configurable nonlinearity
struct Mlp {
    w_in: Linear,
    w_out: Linear,
    act_fn: ActivationFn,
}

impl Mlp {
    fn load(vb: VarBuilder, init: &mut ParamInit, config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            w_in: init.linear(vb.pp("w_in"), config.d_model, config.d_mlp)?,
            w_out: init.linear(vb.pp("w_out"), config.d_mlp, config.d_model)?,
            act_fn: config.act_fn,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hidden = self.w_in.forward(x)?;
        let hidden = match self.act_fn {
            ActivationFn::Gelu => hidden.gelu_erf()?,
            ActivationFn::GeluNew => hidden.gelu()?,
            ActivationFn::Relu => hidden.relu()?,
            ActivationFn::Silu => hidden.silu()?,
        };
        Ok(self.w_out.forward(&hidden)?)
    }
}

struct Block {
    ln1: Option<Norm>,
    attn: Attention,
    ln2: Option<Norm>,
    mlp: Option<Mlp>,
}

impl Block {
    fn load(vb: VarBuilder, init: &mut ParamInit, config: &ModelConfig) -> Result<Self> {
        let ln1 = init.norm(vb.pp("ln1"), config)?;
        let attn = Attention::load(vb.pp("attn"), init, config)?;
        let (ln2, mlp) = if config.attn_only {
            (None, None)
        } else {
            (
                init.norm(vb.pp("ln2"), config)?,
                Some(Mlp::load(vb.pp("mlp"), init, config)?),
            )
        };
        Ok(Self {
            ln1,
            attn,
            ln2,
            mlp,
        })
    }

    fn forward(
        &self,
        x: &Tensor,
        mask: &Tensor,
        layer: usize,
        cache: Option<&mut ActivationCache>,
    ) -> Result<Tensor> {
        let (attn_out, pattern) = self.attn.forward(&apply_norm(self.ln1.as_ref(), x)?, mask)?;
        let resid_mid = (x + &attn_out)?;

        let (mlp_out, resid_post) = match &self.mlp {
            Some(mlp) => {
                let out = mlp.forward(&apply_norm(self.ln2.as_ref(), &resid_mid)?)?;
                let post = (&resid_mid + &out)?;
                (Some(out), post)
            }
            None => (None, resid_mid.clone()),
        };

        if let Some(cache) = cache {
            cache.insert(HookPoint::ResidPre, layer, x.clone());
            cache.insert(HookPoint::Pattern, layer, pattern);
            cache.insert(HookPoint::AttnOut, layer, attn_out);
            cache.insert(HookPoint::ResidMid, layer, resid_mid);
            if let Some(out) = mlp_out {
                cache.insert(HookPoint::MlpOut, layer, out);
            }
            cache.insert(HookPoint::ResidPost, layer, resid_post.clone());
        }
        Ok(resid_post)
    }

    fn forward_with_kv_cache(
        &self,
        x: &Tensor,
        start_pos: usize,
        cache_k: &mut Option<Tensor>,
        cache_v: &mut Option<Tensor>,
    ) -> Result<Tensor> {
        let attn_out = self.attn.forward_with_kv_cache(
            &apply_norm(self.ln1.as_ref(), x)?,
            start_pos,
            cache_k,
            cache_v,
        )?;
        let resid_mid = (x + attn_out)?;
        match &self.mlp {
            Some(mlp) => {
                let out = mlp.forward(&apply_norm(self.ln2.as_ref(), &resid_mid)?)?;
                Ok((resid_mid + out)?)
            }
            None => Ok(resid_mid),
        }
    }
}

/// Autoregressive transformer over a byte vocabulary
pub struct ParityTransformer {
    config: ModelConfig,
    varmap: VarMap,
    w_e: Tensor,
    w_pos: Tensor,
    blocks: Vec<Block>,
    ln_final: Option<Norm>,
    unembed: Linear,
    device: Device,
}

impl ParityTransformer {
    /// Build a freshly initialized model on `device`
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();

        let (w_e, w_pos, blocks, ln_final, unembed) = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
            let mut init = ParamInit::new(&varmap, config.initializer_range, config.seed)?;

            let w_e = init.normal(&vb.pp("embed"), (config.d_vocab, config.d_model), "weight")?;
            let w_pos = init.normal(&vb.pp("pos_embed"), (config.n_ctx, config.d_model), "weight")?;

            let mut blocks = Vec::with_capacity(config.n_layers);
            for i in 0..config.n_layers {
                blocks.push(Block::load(vb.pp(format!("blocks.{i}")), &mut init, config)?);
            }
            let ln_final = init.norm(vb.pp("ln_final"), config)?;
            let unembed = init.linear(vb.pp("unembed"), config.d_model, config.d_vocab_out)?;
            (w_e, w_pos, blocks, ln_final, unembed)
        };

        let model = Self {
            config: config.clone(),
            varmap,
            w_e,
            w_pos,
            blocks,
            ln_final,
            unembed,
            device: device.clone(),
        };
        info!(
            "Model built: {} layers, d_model={}, {} parameters",
            config.n_layers,
            config.d_model,
            model.n_parameters()
        );
        Ok(model)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    pub fn varmap_mut(&mut self) -> &mut VarMap {
        &mut self.varmap
    }

    pub fn n_layers(&self) -> usize {
        self.config.n_layers
    }

    pub fn n_ctx(&self) -> usize {
        self.config.n_ctx
    }

    /// Exact number of trainable scalars
    pub fn n_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count())
            .sum()
    }

    /// Parameter storage in bytes
    pub fn parameter_bytes(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|v| v.as_tensor().elem_count() * v.as_tensor().dtype().size_in_bytes())
            .sum()
    }

    /// Parameter storage in decimal megabytes (1 MB = 10^6 bytes)
    pub fn size_mb(&self) -> f64 {
        self.parameter_bytes() as f64 / 1e6
    }

    fn check_tokens(&self, tokens: &Tensor, start_pos: usize) -> Result<(usize, usize)> {
        let (b, seq_len) = tokens.dims2()?;
        anyhow::ensure!(seq_len > 0, "Empty token sequence");
        anyhow::ensure!(
            start_pos + seq_len <= self.config.n_ctx,
            "Sequence of {} positions exceeds n_ctx {}",
            start_pos + seq_len,
            self.config.n_ctx
        );
        let max_id = tokens.max_all()?.to_dtype(DType::U32)?.to_scalar::<u32>()?;
        anyhow::ensure!(
            (max_id as usize) < self.config.d_vocab,
            "Token id {max_id} outside vocabulary of {}",
            self.config.d_vocab
        );
        Ok((b, seq_len))
    }

    fn embed(&self, tokens: &Tensor, start_pos: usize) -> Result<Tensor> {
        let (b, seq_len) = self.check_tokens(tokens, start_pos)?;
        let ids = tokens.to_dtype(DType::U32)?.flatten_all()?;
        let tok = self
            .w_e
            .index_select(&ids, 0)?
            .reshape((b, seq_len, self.config.d_model))?;
        let pos = self.w_pos.narrow(0, start_pos, seq_len)?.unsqueeze(0)?;
        Ok(tok.broadcast_add(&pos)?)
    }

    fn unembed(&self, x: &Tensor) -> Result<Tensor> {
        let x = apply_norm(self.ln_final.as_ref(), x)?;
        Ok(self.unembed.forward(&x)?)
    }

    fn forward_impl(
        &self,
        tokens: &Tensor,
        mut cache: Option<&mut ActivationCache>,
    ) -> Result<Tensor> {
        let mut x = self.embed(tokens, 0)?;
        let seq_len = x.dim(1)?;
        let mask = create_causal_mask(seq_len, &self.device, x.dtype())?;
        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(&x, &mask, i, cache.as_deref_mut())?;
        }
        self.unembed(&x)
    }

    /// Logits of shape `(batch, pos, d_vocab_out)`
    pub fn forward(&self, tokens: &Tensor) -> Result<Tensor> {
        self.forward_impl(tokens, None)
    }

    /// Logits plus every hooked activation of the pass
    pub fn run_with_cache(&self, tokens: &Tensor) -> Result<(Tensor, ActivationCache)> {
        let mut cache = ActivationCache::new();
        let logits = self.forward_impl(tokens, Some(&mut cache))?;
        debug!("Cached {} activations", cache.len());
        Ok((logits, cache))
    }

    pub fn new_kv_cache(&self) -> KVCache {
        KVCache::new(self.config.n_layers)
    }

    /// Process `tokens` as the continuation of whatever `kv_cache` holds
    ///
    /// Returns logits of shape `(batch, new_positions, d_vocab_out)`.
    pub fn forward_with_kv_cache(&self, tokens: &Tensor, kv_cache: &mut KVCache) -> Result<Tensor> {
        let start_pos = kv_cache.seq_len();
        let mut x = self.embed(tokens, start_pos)?;
        for (i, block) in self.blocks.iter().enumerate() {
            let (cache_k, cache_v) = kv_cache.layer_mut(i);
            x = block.forward_with_kv_cache(&x, start_pos, cache_k, cache_v)?;
        }
        self.unembed(&x)
    }
}
