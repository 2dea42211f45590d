//! Activation cache for storing intermediate transformer states

use anyhow::Result;
use candle_core::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Tap locations inside a transformer block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    /// Residual stream entering the block: `(batch, pos, d_model)`
    ResidPre,
    /// Attention output before it is added to the residual
    AttnOut,
    /// Residual stream between attention and MLP
    ResidMid,
    /// MLP output before it is added to the residual
    MlpOut,
    /// Residual stream leaving the block
    ResidPost,
    /// Attention probabilities: `(batch, heads, query, key)`
    Pattern,
}

impl HookPoint {
    pub const ALL: [HookPoint; 6] = [
        HookPoint::ResidPre,
        HookPoint::AttnOut,
        HookPoint::ResidMid,
        HookPoint::MlpOut,
        HookPoint::ResidPost,
        HookPoint::Pattern,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HookPoint::ResidPre => "resid_pre",
            HookPoint::AttnOut => "attn_out",
            HookPoint::ResidMid => "resid_mid",
            HookPoint::MlpOut => "mlp_out",
            HookPoint::ResidPost => "resid_post",
            HookPoint::Pattern => "pattern",
        }
    }

    /// Whether the hook carries a `(batch, pos, d_model)` residual-width tensor
    pub fn is_residual_width(&self) -> bool {
        !matches!(self, HookPoint::Pattern)
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HookPoint {
    type Err = anyhow::Error;

    /// Accepts full names (`resid_mid`) and the short residual names (`mid`)
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre" => Ok(HookPoint::ResidPre),
            "mid" => Ok(HookPoint::ResidMid),
            "post" => Ok(HookPoint::ResidPost),
            other => HookPoint::ALL
                .into_iter()
                .find(|h| h.name() == other)
                .ok_or_else(|| anyhow::anyhow!("Unknown hook point '{other}'")),
        }
    }
}

/// Stores activations from a forward pass, keyed by `(hook, layer)`
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: BTreeMap<(HookPoint, usize), Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an activation, replacing any previous one at the same key
    pub fn insert(&mut self, hook: HookPoint, layer: usize, tensor: Tensor) {
        self.activations.insert((hook, layer), tensor);
    }

    pub fn get(&self, hook: HookPoint, layer: usize) -> Option<&Tensor> {
        self.activations.get(&(hook, layer))
    }

    /// Like [`ActivationCache::get`] but with a descriptive error
    pub fn require(&self, hook: HookPoint, layer: usize) -> Result<&Tensor> {
        self.get(hook, layer)
            .ok_or_else(|| anyhow::anyhow!("{hook} for layer {layer} not in cache"))
    }

    /// Residual activation with batch and position merged into one axis
    ///
    /// Returns shape `(batch * pos, d_model)`.
    pub fn flatten_positions(&self, hook: HookPoint, layer: usize) -> Result<Tensor> {
        anyhow::ensure!(
            hook.is_residual_width(),
            "{hook} is not a (batch, pos, d_model) activation"
        );
        let tensor = self.require(hook, layer)?;
        let (b, p, d) = tensor.dims3()?;
        Ok(tensor.reshape((b * p, d))?)
    }

    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }
}
