//! Activation collection over synthetic batches
//!
//! Runs the forward pass for each batch, stacks the requested layers'
//! `resid_post`, and gathers the vectors at every word's first and last
//! token. Gathered tensors are moved to host memory as F32 and appended to
//! an [`ActivationStore`].

use anyhow::{Context, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use ndarray::Array2;
use tracing::{debug, info};

use crate::batch::Batch;
use crate::cache::HookPoint;
use crate::model::ProbeModel;

/// Which token of a word is read out
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenRole {
    First,
    Last,
}

/// Scope in which forward passes are read-only.
///
/// candle only records an op graph for tensors derived from a `Var`; every
/// activation captured under this scope is detached so nothing keeps such a
/// graph alive. Dropping the guard ends the scope.
#[derive(Debug)]
pub struct InferenceMode {
    _private: (),
}

impl InferenceMode {
    pub fn enter() -> Self {
        debug!("Entering inference mode");
        Self { _private: () }
    }

    /// Detach a tensor captured inside the scope
    pub fn capture(&self, tensor: &Tensor) -> Tensor {
        tensor.detach()
    }
}

impl Drop for InferenceMode {
    fn drop(&mut self) {
        debug!("Leaving inference mode");
    }
}

/// Gather `residuals[l, b, indices[b, k], :]` for every layer, row and slot.
///
/// `residuals` is (n_layers, batch, seq_len, d_model) and `indices` is
/// (batch, num_words); the result is (n_layers, batch, num_words, d_model).
pub fn gather_positions(residuals: &Tensor, indices: &Array2<usize>) -> Result<Tensor> {
    let (n_layers, batch, seq_len, d_model) = residuals.dims4()?;
    let (rows, num_words) = indices.dim();
    anyhow::ensure!(
        rows == batch,
        "Index matrix has {rows} rows but residuals have batch {batch}"
    );

    let mut flat = Vec::with_capacity(rows * num_words);
    for ((row, slot), &pos) in indices.indexed_iter() {
        anyhow::ensure!(
            pos < seq_len,
            "Row {row} slot {slot}: position {pos} out of range (seq_len={seq_len})"
        );
        flat.push((row * seq_len + pos) as u32);
    }
    let flat = Tensor::from_vec(flat, rows * num_words, residuals.device())?;

    Ok(residuals
        .contiguous()?
        .reshape((n_layers, batch * seq_len, d_model))?
        .index_select(&flat, 1)?
        .reshape((n_layers, batch, num_words, d_model))?)
}

/// Gathered vectors for one batch
#[derive(Debug, Clone)]
pub struct ActivationRecord {
    /// Model layers covered by the leading axis, in order
    layers: Vec<usize>,
    /// (n_layers, batch, num_words, d_model)
    first: Tensor,
    /// (n_layers, batch, num_words, d_model)
    last: Tensor,
}

impl ActivationRecord {
    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    pub fn first(&self) -> &Tensor {
        &self.first
    }

    pub fn last(&self) -> &Tensor {
        &self.last
    }

    pub fn get(&self, role: TokenRole) -> &Tensor {
        match role {
            TokenRole::First => &self.first,
            TokenRole::Last => &self.last,
        }
    }

    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.last.dim(1)?)
    }

    pub fn num_words(&self) -> Result<usize> {
        Ok(self.last.dim(2)?)
    }

    /// (batch, num_words, d_model) for one model layer
    pub fn layer(&self, layer: usize, role: TokenRole) -> Result<Tensor> {
        let slot = self
            .layers
            .iter()
            .position(|&l| l == layer)
            .with_context(|| format!("Layer {layer} not collected (have {:?})", self.layers))?;
        Ok(self.get(role).i(slot)?)
    }

    /// One layer flattened to (batch * num_words, d_model), row-major over
    /// (row, slot)
    pub fn layer_matrix(&self, layer: usize, role: TokenRole) -> Result<Array2<f32>> {
        let t = self.layer(layer, role)?;
        let (batch, num_words, d_model) = t.dims3()?;
        let data: Vec<f32> = t.flatten_all()?.to_vec1()?;
        Ok(Array2::from_shape_vec((batch * num_words, d_model), data)?)
    }
}

/// Append-only accumulator of per-batch records
#[derive(Debug, Default)]
pub struct ActivationStore {
    records: Vec<ActivationRecord>,
}

impl ActivationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: ActivationRecord) {
        self.records.push(record);
    }

    /// First-token tensors in collection order
    pub fn first_token(&self) -> impl Iterator<Item = &Tensor> {
        self.records.iter().map(ActivationRecord::first)
    }

    /// Last-token tensors in collection order
    pub fn last_token(&self) -> impl Iterator<Item = &Tensor> {
        self.records.iter().map(ActivationRecord::last)
    }

    pub fn records(&self) -> &[ActivationRecord] {
        &self.records
    }

    /// Number of accumulated batches
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Drives forward passes and gathers word-position activations
pub struct ActivationCollector<'a> {
    model: &'a ProbeModel,
    layers: Vec<usize>,
    hooks: Vec<HookPoint>,
}

impl<'a> ActivationCollector<'a> {
    /// Collect `resid_post` for `layers` (empty = every layer)
    pub fn new(model: &'a ProbeModel, layers: &[usize]) -> Result<Self> {
        let layers: Vec<usize> = if layers.is_empty() {
            (0..model.n_layers()).collect()
        } else {
            layers.to_vec()
        };
        for &layer in &layers {
            anyhow::ensure!(
                layer < model.n_layers(),
                "Layer {layer} out of range ({} layers)",
                model.n_layers()
            );
        }
        let hooks = HookPoint::resid_post(&layers);
        Ok(Self {
            model,
            layers,
            hooks,
        })
    }

    pub fn layers(&self) -> &[usize] {
        &self.layers
    }

    /// Forward one batch and gather its first/last-token vectors
    pub fn collect_batch(&self, batch: &Batch, mode: &InferenceMode) -> Result<ActivationRecord> {
        let input_ids = batch.tokens_tensor(self.model.device())?;
        let (_, cache) = self
            .model
            .run_with_cache(&input_ids, &self.hooks)
            .context("Forward pass failed")?;

        let residuals = mode.capture(&cache.stack_resid_post(&self.layers)?);
        let first = gather_positions(&residuals, batch.first_token_indices())
            .context("Gathering first-token residuals")?;
        let last = gather_positions(&residuals, batch.last_token_indices())
            .context("Gathering last-token residuals")?;

        Ok(ActivationRecord {
            layers: self.layers.clone(),
            first: to_host(&first)?,
            last: to_host(&last)?,
        })
    }

    /// Collect every batch into a fresh store
    pub fn collect<I>(&self, batches: I, mode: &InferenceMode) -> Result<ActivationStore>
    where
        I: IntoIterator<Item = Result<Batch>>,
    {
        let mut store = ActivationStore::new();
        for (i, batch) in batches.into_iter().enumerate() {
            let batch = batch.with_context(|| format!("Synthesizing batch {i}"))?;
            let record = self.collect_batch(&batch, mode)?;
            if i == 0 {
                debug!(
                    "Shapes: first {:?}, last {:?}",
                    record.first.dims(),
                    record.last.dims()
                );
            }
            store.push(record);

            if (i + 1) % 10 == 0 {
                info!("Collected {} batches", i + 1);
            }
        }
        Ok(store)
    }
}

fn to_host(tensor: &Tensor) -> Result<Tensor> {
    Ok(tensor.to_device(&Device::Cpu)?.to_dtype(DType::F32)?)
}
