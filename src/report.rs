//! Held-out evaluation and reporting
//!
//! Predicts ordinal slots for fresh batches drawn from the test pool and
//! pairs each prediction with the word's absolute token position, so the
//! histogram shows whether the probe reads slot order or raw position.

use anyhow::{Context, Result};
use ndarray::Array2;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

use crate::batch::BatchSynthesizer;
use crate::collector::{ActivationCollector, InferenceMode, TokenRole};
use crate::model::ProbeModel;
use crate::probe::PositionProbe;
use crate::vocab::WordPool;

/// One evaluated word instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PredictionRecord {
    /// Ordinal slot of the word in its run
    pub index: usize,
    /// Absolute token position read out
    pub abs_pos: usize,
    /// Predicted slot
    pub pred: usize,
}

/// Table of predictions with columns (index, abs_pos, pred)
#[derive(Debug, Clone, Default, Serialize)]
pub struct PredictionTable {
    num_words: usize,
    records: Vec<PredictionRecord>,
}

impl PredictionTable {
    pub fn new(num_words: usize) -> Self {
        Self {
            num_words,
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[PredictionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append one batch: `positions` is (batch, num_words) and `predictions`
    /// is flattened row-major over (row, slot).
    pub fn extend_from_batch(&mut self, positions: &Array2<usize>, predictions: &[usize]) -> Result<()> {
        let (rows, num_words) = positions.dim();
        anyhow::ensure!(
            num_words == self.num_words,
            "Batch has {num_words} words per row, table expects {}",
            self.num_words
        );
        anyhow::ensure!(
            predictions.len() == rows * num_words,
            "{} predictions for a ({rows}, {num_words}) batch",
            predictions.len()
        );

        for ((row, slot), &abs_pos) in positions.indexed_iter() {
            self.records.push(PredictionRecord {
                index: slot,
                abs_pos,
                pred: predictions[row * num_words + slot],
            });
        }
        Ok(())
    }

    /// Prediction counts keyed by (index, abs_pos), then by predicted label
    pub fn counts(&self) -> BTreeMap<(usize, usize), BTreeMap<usize, usize>> {
        let mut counts: BTreeMap<(usize, usize), BTreeMap<usize, usize>> = BTreeMap::new();
        for r in &self.records {
            *counts
                .entry((r.index, r.abs_pos))
                .or_default()
                .entry(r.pred)
                .or_default() += 1;
        }
        counts
    }

    /// Fraction of correct predictions per ordinal slot
    pub fn accuracy_by_index(&self) -> Vec<f64> {
        let mut correct = vec![0usize; self.num_words];
        let mut total = vec![0usize; self.num_words];
        for r in &self.records {
            if r.index < self.num_words {
                total[r.index] += 1;
                if r.pred == r.index {
                    correct[r.index] += 1;
                }
            }
        }
        correct
            .iter()
            .zip(&total)
            .map(|(&c, &t)| if t == 0 { 0.0 } else { c as f64 / t as f64 })
            .collect()
    }

    /// First `n` rows as a text table
    pub fn head(&self, n: usize) -> String {
        let mut out = format!("{:>8} {:>6} {:>8} {:>5}\n", "", "index", "abs_pos", "pred");
        for (i, r) in self.records.iter().take(n).enumerate() {
            let _ = writeln!(out, "{i:>8} {:>6} {:>8} {:>5}", r.index, r.abs_pos, r.pred);
        }
        let _ = write!(out, "[{} rows x 3 columns]", self.records.len());
        out
    }

    /// Text histogram of predicted labels over absolute position, one
    /// facet per ordinal slot.
    ///
    /// Each bar is stacked by predicted label (one glyph per label) and
    /// scaled so the tallest position in the table spans `width` glyphs.
    pub fn render_histogram(&self, width: usize) -> String {
        let counts = self.counts();
        let max_total = counts
            .values()
            .map(|by_pred| by_pred.values().sum::<usize>())
            .max()
            .unwrap_or(0);

        let mut out = String::new();
        let _ = writeln!(out, "legend: glyph = predicted label");
        for index in 0..self.num_words {
            let _ = writeln!(out, "index={index}");
            for (&(_, abs_pos), by_pred) in counts.range((index, 0)..=(index, usize::MAX)) {
                let total: usize = by_pred.values().sum();
                let mut bar = String::new();
                for (&pred, &count) in by_pred {
                    let len = if max_total == 0 {
                        0
                    } else {
                        (count * width + max_total / 2) / max_total
                    };
                    bar.extend(std::iter::repeat(label_glyph(pred)).take(len.max(1)));
                }
                let _ = writeln!(out, "  abs_pos {abs_pos:>4} | {bar} ({total})");
            }
        }
        out
    }

    /// Write the table as JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Predictions saved to {}", path.display());
        Ok(())
    }
}

fn label_glyph(label: usize) -> char {
    const GLYPHS: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
    GLYPHS.get(label).map_or('?', |&b| b as char)
}

/// Predict slots for `test_batch_count` fresh batches from `pool`.
///
/// Only the probe's layer is captured.
#[allow(clippy::too_many_arguments)]
pub fn evaluate<R: Rng>(
    model: &ProbeModel,
    probe: &PositionProbe,
    synthesizer: &BatchSynthesizer,
    pool: &WordPool,
    test_batch_count: usize,
    batch_size: usize,
    rng: &mut R,
    mode: &InferenceMode,
) -> Result<PredictionTable> {
    let collector = ActivationCollector::new(model, &[probe.layer()])?;
    let mut table = PredictionTable::new(synthesizer.num_words());

    for i in 0..test_batch_count {
        let batch = synthesizer
            .gen_batch(model.tokenizer(), batch_size, pool, rng)
            .with_context(|| format!("Synthesizing test batch {i}"))?;
        let record = collector.collect_batch(&batch, mode)?;
        let features = record.layer_matrix(probe.layer(), probe.role())?;
        let predictions = probe.predict_f32(&features);

        let positions = match probe.role() {
            TokenRole::First => batch.first_token_indices(),
            TokenRole::Last => batch.last_token_indices(),
        };
        table.extend_from_batch(
            positions,
            predictions
                .as_slice()
                .context("Non-contiguous predictions")?,
        )?;
    }

    info!(
        "Evaluated {} words over {test_batch_count} test batches",
        table.len()
    );
    Ok(table)
}
