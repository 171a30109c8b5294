//! GPT-2 forward pass with per-layer activation capture
//!
//! Custom implementation that runs block-by-block so the residual stream
//! after each block (`resid_post`) can be captured for probing.
//!
//! Architecture notes:
//! - Pre-LayerNorm blocks (ln_1 → attention, ln_2 → MLP)
//! - Learned absolute position embeddings (`wpe`)
//! - HF checkpoints store projections as Conv1D, i.e. weight shape
//!   (in, out); they are transposed once at load time
//! - MLP activation is the tanh-approximated GELU ("gelu_new")

use anyhow::{Context, Result};
use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::{embedding, layer_norm, Embedding, LayerNorm, Linear, VarBuilder};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tracing::{debug, info};

use crate::cache::{ActivationCache, HookPoint};
use crate::model::ResidualBackend;

/// Model configuration (matches HuggingFace config.json for GPT-2)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Gpt2Config {
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    pub n_positions: usize,
    pub vocab_size: usize,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub n_inner: Option<usize>,
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    fn mlp_size(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// Load a Conv1D projection as a candle `Linear`
fn conv1d(n_in: usize, n_out: usize, vb: VarBuilder) -> Result<Linear> {
    let weight = vb.get((n_in, n_out), "weight")?.t()?.contiguous()?;
    let bias = vb.get(n_out, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

/// Causal mask of shape [1, 1, seq_len, seq_len]: 0 where j <= i, -inf above
fn causal_mask(seq_len: usize, device: &Device, dtype: DType) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY }))
        .collect();
    Ok(Tensor::from_vec(mask, (1, 1, seq_len, seq_len), device)?.to_dtype(dtype)?)
}

/// Multi-head self-attention with fused QKV projection
struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let d = config.n_embd;
        Ok(Self {
            c_attn: conv1d(d, 3 * d, vb.pp("c_attn"))?,
            c_proj: conv1d(d, d, vb.pp("c_proj"))?,
            n_head: config.n_head,
            head_dim: d / config.n_head,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let (b, seq_len, d) = x.dims3()?;
        let qkv = self.c_attn.forward(x)?;

        let heads = |offset: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, offset, d)?
                .contiguous()?
                .reshape((b, seq_len, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let q = heads(0)?;
        let k = heads(d)?;
        let v = heads(2 * d)?;

        let scale = 1.0 / (self.head_dim as f64).sqrt();
        let attn_weights = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let attn_weights = attn_weights.broadcast_add(mask)?;
        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;

        let attn_output = attn_weights
            .matmul(&v)?
            .transpose(1, 2)?
            .reshape((b, seq_len, d))?;
        Ok(self.c_proj.forward(&attn_output)?)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let hidden = config.mlp_size();
        Ok(Self {
            c_fc: conv1d(config.n_embd, hidden, vb.pp("c_fc"))?,
            c_proj: conv1d(hidden, config.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu()?;
        Ok(self.c_proj.forward(&h)?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(vb: VarBuilder, config: &Gpt2Config) -> Result<Self> {
        let eps = config.layer_norm_epsilon;
        Ok(Self {
            ln_1: layer_norm(config.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(vb.pp("attn"), config)?,
            ln_2: layer_norm(config.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(vb.pp("mlp"), config)?,
        })
    }

    /// Returns the residual stream after this block
    fn forward(&self, x: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let attn_out = self.attn.forward(&self.ln_1.forward(x)?, mask)?;
        let resid_mid = (x + attn_out)?;
        let mlp_out = self.mlp.forward(&self.ln_2.forward(&resid_mid)?)?;
        Ok((resid_mid + mlp_out)?)
    }
}

/// GPT-2 with residual-stream capture
pub struct ProbeGpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    config: Gpt2Config,
}

impl ProbeGpt2 {
    /// Load model from HuggingFace
    pub fn load(model_id: &str, device: &Device, dtype: DType) -> Result<Self> {
        info!("Loading GPT-2 from: {}", model_id);

        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));

        let config_path = repo
            .get("config.json")
            .context("Failed to download config.json")?;
        let config_str = std::fs::read_to_string(&config_path).context("Failed to read config")?;
        let config: Gpt2Config = serde_json::from_str(&config_str)?;

        info!(
            "Model config: {} layers, {} hidden, {} vocab",
            config.n_layer, config.n_embd, config.vocab_size
        );

        let weights_path = repo
            .get("model.safetensors")
            .context("Failed to download model.safetensors")?;
        let vb = unsafe { VarBuilder::from_mmaped_safetensors(&[weights_path], dtype, device)? };

        // Some exports keep the GPT2LMHeadModel "transformer." prefix
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };

        let model = Self::new(config, vb)?;
        info!("Model loaded successfully with {} layers", model.config.n_layer);
        Ok(model)
    }

    /// Build from an already-scoped VarBuilder (keys `wte`, `wpe`, `h.{i}`, `ln_f`)
    pub fn new(config: Gpt2Config, vb: VarBuilder) -> Result<Self> {
        anyhow::ensure!(
            config.n_embd % config.n_head == 0,
            "n_embd {} not divisible by n_head {}",
            config.n_embd,
            config.n_head
        );

        let wte = embedding(config.vocab_size, config.n_embd, vb.pp("wte"))?;
        let wpe = embedding(config.n_positions, config.n_embd, vb.pp("wpe"))?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for i in 0..config.n_layer {
            blocks.push(Block::load(vb.pp(format!("h.{i}")), &config)?);
        }

        let ln_f = layer_norm(config.n_embd, config.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            config,
        })
    }

    /// Forward pass capturing `resid_post` at the requested hooks
    pub fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hooks: &[HookPoint],
    ) -> Result<(Tensor, ActivationCache)> {
        let (_batch, seq_len) = input_ids.dims2()?;
        anyhow::ensure!(
            seq_len <= self.config.n_positions,
            "Sequence length {seq_len} exceeds n_positions {}",
            self.config.n_positions
        );

        let mut cache = ActivationCache::new();
        let positions = Tensor::arange(0u32, seq_len as u32, input_ids.device())?;
        let mut hidden = self
            .wte
            .forward(input_ids)?
            .broadcast_add(&self.wpe.forward(&positions)?)?;
        let mask = causal_mask(seq_len, input_ids.device(), hidden.dtype())?;

        for (i, block) in self.blocks.iter().enumerate() {
            hidden = block.forward(&hidden, &mask)?;

            let hook = HookPoint::ResidPost(i);
            if hooks.contains(&hook) {
                cache.insert(hook, hidden.clone());
            }
        }
        debug!("Forward pass captured {} activations", cache.len());

        let output = self.ln_f.forward(&hidden)?;
        Ok((output, cache))
    }
}

impl ResidualBackend for ProbeGpt2 {
    fn n_layers(&self) -> usize {
        self.config.n_layer
    }

    fn d_model(&self) -> usize {
        self.config.n_embd
    }

    fn vocab_size(&self) -> usize {
        self.config.vocab_size
    }

    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hooks: &[HookPoint],
    ) -> Result<(Tensor, ActivationCache)> {
        ProbeGpt2::forward_with_cache(self, input_ids, hooks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_config() -> Gpt2Config {
        Gpt2Config {
            n_embd: 8,
            n_head: 2,
            n_layer: 3,
            n_positions: 16,
            vocab_size: 32,
            layer_norm_epsilon: 1e-5,
            n_inner: None,
        }
    }

    #[test]
    fn test_causal_mask() {
        let mask = causal_mask(3, &Device::Cpu, DType::F32).unwrap();
        assert_eq!(mask.dims(), &[1, 1, 3, 3]);
        let rows: Vec<Vec<f32>> = mask.squeeze(0).unwrap().squeeze(0).unwrap().to_vec2().unwrap();
        assert_eq!(rows[0][0], 0.0);
        assert!(rows[0][1].is_infinite());
        assert_eq!(rows[2], vec![0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_forward_captures_requested_layers() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ProbeGpt2::new(tiny_config(), vb).unwrap();

        let ids = Tensor::new(&[[1u32, 2, 3, 4, 5], [5, 4, 3, 2, 1]], &device).unwrap();
        let hooks = HookPoint::resid_post(&[0, 2]);
        let (output, cache) = model.forward_with_cache(&ids, &hooks).unwrap();

        assert_eq!(output.dims(), &[2, 5, 8]);
        assert_eq!(cache.len(), 2);
        assert!(cache.get(HookPoint::ResidPost(1)).is_none());
        assert_eq!(cache.get(HookPoint::ResidPost(2)).unwrap().dims(), &[2, 5, 8]);
    }

    #[test]
    fn test_forward_rejects_long_sequences() {
        let device = Device::Cpu;
        let vb = VarBuilder::zeros(DType::F32, &device);
        let model = ProbeGpt2::new(tiny_config(), vb).unwrap();

        let ids = Tensor::zeros((1, 17), DType::U32, &device).unwrap();
        assert!(model.forward_with_cache(&ids, &[]).is_err());
    }

    #[test]
    #[ignore = "requires model download"]
    fn test_load_gpt2_small() {
        let model = ProbeGpt2::load("openai-community/gpt2", &Device::Cpu, DType::F32).unwrap();
        assert_eq!(model.n_layers(), 12);
        assert_eq!(model.d_model(), 768);
    }
}
