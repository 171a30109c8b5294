//! ProbeModel wrapper for activation extraction
//!
//! Pairs a [`ResidualBackend`] with its tokenizer and device so the
//! pipeline stages see a single handle.

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use tracing::info;

use crate::cache::{ActivationCache, HookPoint};
use crate::forward_gpt2::ProbeGpt2;
use crate::tokenizer::{HfTokenizer, WordTokenizer};

/// Backend trait for transformer forward passes with activation capture.
///
/// Implementing this trait is the only requirement for probing a new model.
pub trait ResidualBackend {
    // --- Metadata ---
    fn n_layers(&self) -> usize;
    fn d_model(&self) -> usize;
    fn vocab_size(&self) -> usize;

    /// Run the model over `input_ids` (batch, seq_len), retaining only the
    /// activations named in `hooks`.
    ///
    /// Returns the final normalized hidden state and the cache.
    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hooks: &[HookPoint],
    ) -> Result<(Tensor, ActivationCache)>;
}

/// CUDA device 0 when available, unless `force_cpu` is `Some(true)`
pub fn select_device(force_cpu: Option<bool>) -> Device {
    if force_cpu == Some(true) {
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

/// High-level model handle for probing experiments
pub struct ProbeModel {
    backend: Box<dyn ResidualBackend>,
    tokenizer: Box<dyn WordTokenizer>,
    device: Device,
    model_id: String,
}

impl ProbeModel {
    /// Assemble a model from parts
    pub fn new(
        backend: Box<dyn ResidualBackend>,
        tokenizer: Box<dyn WordTokenizer>,
        device: Device,
        model_id: &str,
    ) -> Self {
        Self {
            backend,
            tokenizer,
            device,
            model_id: model_id.to_string(),
        }
    }

    /// Load a GPT-2 family model from HuggingFace (tries CUDA, falls back to CPU)
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        Self::from_pretrained_with_device(model_id, None)
    }

    /// Load with explicit device choice (None = auto-detect)
    pub fn from_pretrained_with_device(model_id: &str, force_cpu: Option<bool>) -> Result<Self> {
        let device = select_device(force_cpu);

        info!("Loading model: {}", model_id);
        info!("Device: {:?}", device);

        let tokenizer = HfTokenizer::from_pretrained(model_id)?;
        let backend = ProbeGpt2::load(model_id, &device, DType::F32)?;

        Ok(Self::new(
            Box::new(backend),
            Box::new(tokenizer),
            device,
            model_id,
        ))
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn tokenizer(&self) -> &dyn WordTokenizer {
        self.tokenizer.as_ref()
    }

    /// Number of layers in the model
    pub fn n_layers(&self) -> usize {
        self.backend.n_layers()
    }

    /// Hidden dimension of the model
    pub fn d_model(&self) -> usize {
        self.backend.d_model()
    }

    pub fn vocab_size(&self) -> usize {
        self.backend.vocab_size()
    }

    /// Forward pass over a token matrix, capturing `hooks`
    pub fn run_with_cache(
        &self,
        input_ids: &Tensor,
        hooks: &[HookPoint],
    ) -> Result<(Tensor, ActivationCache)> {
        for hook in hooks {
            anyhow::ensure!(
                hook.layer() < self.n_layers(),
                "{hook} requested but {} has {} layers",
                self.model_id,
                self.n_layers()
            );
        }
        self.backend.forward_with_cache(input_ids, hooks)
    }
}
