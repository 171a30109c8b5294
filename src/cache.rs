//! Activation cache for storing intermediate transformer states
//!
//! Activations are keyed by an explicit [`HookPoint`] instead of a string
//! name, so a forward pass only retains what the caller asked for.

use anyhow::Result;
use candle_core::Tensor;
use std::collections::BTreeMap;
use std::fmt;

/// A capture site inside the forward pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    /// Residual stream after block `i`, shape (batch, seq_len, d_model)
    ResidPost(usize),
}

impl HookPoint {
    /// `resid_post` hooks for the given layers, in the given order
    pub fn resid_post(layers: &[usize]) -> Vec<Self> {
        layers.iter().map(|&layer| Self::ResidPost(layer)).collect()
    }

    pub fn layer(&self) -> usize {
        match self {
            Self::ResidPost(layer) => *layer,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResidPost(layer) => write!(f, "blocks.{layer}.hook_resid_post"),
        }
    }
}

/// Stores the requested activations from one forward pass
#[derive(Debug, Default)]
pub struct ActivationCache {
    activations: BTreeMap<HookPoint, Tensor>,
}

impl ActivationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an activation, replacing any previous one at the same hook
    pub fn insert(&mut self, hook: HookPoint, tensor: Tensor) {
        self.activations.insert(hook, tensor);
    }

    pub fn get(&self, hook: HookPoint) -> Option<&Tensor> {
        self.activations.get(&hook)
    }

    /// Number of cached activations
    pub fn len(&self) -> usize {
        self.activations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activations.is_empty()
    }

    /// Stack `resid_post` for `layers` into (n_layers, batch, seq_len, d_model).
    ///
    /// The leading axis follows the order of `layers`.
    pub fn stack_resid_post(&self, layers: &[usize]) -> Result<Tensor> {
        anyhow::ensure!(!layers.is_empty(), "No layers requested from the cache");
        let tensors = layers
            .iter()
            .map(|&layer| {
                let hook = HookPoint::ResidPost(layer);
                self.get(hook)
                    .ok_or_else(|| anyhow::anyhow!("{hook} not in cache"))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::stack(&tensors, 0)?)
    }
}
