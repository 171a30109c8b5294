//! Experiment runner for word-position probing
//!
//! Coordinates vocabulary filtering, batch synthesis, activation
//! collection, probe training and held-out evaluation.

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::batch::{Batch, BatchSynthesizer};
use crate::collector::{ActivationCollector, InferenceMode, TokenRole};
use crate::model::ProbeModel;
use crate::probe::{ProbeResults, ProbeTrainer, SubsamplePolicy};
use crate::report::{evaluate, PredictionTable};
use crate::vocab::filter_vocabulary;

/// Prefix every synthetic run is appended to
pub const DEFAULT_PREFIX: &str = "The United States Declaration of Independence received its first formal public reading, in Philadelphia.\nWhen";

/// Configuration for a probing experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// Text preceding the word run
    pub prefix: String,
    /// Words per synthetic run (number of classes)
    pub num_words: usize,
    /// Longest word kept, in tokens
    pub max_word_length: usize,
    /// Probability that a word lands in the train pool
    pub train_fraction: f64,
    /// Rows per synthetic batch
    pub batch_size: usize,
    /// Training batches to collect
    pub epochs: usize,
    /// Layer the evaluated probe reads
    pub layer: usize,
    /// Extra layers to probe and compare (empty = only `layer`)
    pub scan_layers: Vec<usize>,
    /// Layers to capture (empty = every layer). `layer` and `scan_layers`
    /// are always added to a non-empty subset.
    pub collect_layers: Vec<usize>,
    /// Token of each word the probe reads
    pub token_role: TokenRole,
    /// Maximum number of examples fed to the classifier
    pub sample_cap: usize,
    /// Held-out fraction of the selected examples
    pub test_fraction: f64,
    pub subsample_policy: SubsamplePolicy,
    /// Inverse regularization strength (C)
    pub inverse_regularization: f64,
    pub max_iterations: u64,
    /// Fresh batches drawn from the test pool for evaluation
    pub test_batches: usize,
    /// Random seed for reproducibility
    pub seed: u64,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            num_words: 7,
            max_word_length: 3,
            train_fraction: 0.8,
            batch_size: 256,
            epochs: 10,
            layer: 0,
            scan_layers: vec![],
            collect_layers: vec![],
            token_role: TokenRole::Last,
            sample_cap: 10_000,
            test_fraction: 0.1,
            subsample_policy: SubsamplePolicy::Permutation,
            inverse_regularization: 1.0,
            max_iterations: 100,
            test_batches: 10,
            seed: 42,
        }
    }
}

impl ExperimentConfig {
    /// Load a JSON config; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    /// Layers to capture for a model with `n_layers` layers
    pub fn collected_layers(&self, n_layers: usize) -> Vec<usize> {
        if self.collect_layers.is_empty() {
            return (0..n_layers).collect();
        }
        let mut layers = self.collect_layers.clone();
        for &layer in std::iter::once(&self.layer).chain(&self.scan_layers) {
            if !layers.contains(&layer) {
                layers.push(layer);
            }
        }
        layers
    }

    fn trainer(&self) -> ProbeTrainer {
        ProbeTrainer::new()
            .max_iterations(self.max_iterations)
            .inverse_regularization(self.inverse_regularization)
            .sample_cap(self.sample_cap)
            .test_fraction(self.test_fraction)
            .policy(self.subsample_policy)
    }
}

/// Results from a full experiment
#[derive(Debug, Serialize)]
pub struct ExperimentResults {
    pub model_id: String,
    pub config: ExperimentConfig,
    /// Prefix token count, start marker included
    pub prefix_length: usize,
    /// Model layers held by every activation record
    pub collected_layers: Vec<usize>,
    pub train_bucket_sizes: Vec<usize>,
    pub test_bucket_sizes: Vec<usize>,
    /// Probe on `config.layer`
    pub probe: ProbeResults,
    /// One entry per scanned layer (empty without a scan)
    pub layer_scan: Vec<ProbeResults>,
    pub best_layer: usize,
    pub best_accuracy: f64,
    /// Held-out accuracy per ordinal slot
    pub slot_accuracy: Vec<f64>,
    pub predictions: PredictionTable,
}

impl ExperimentResults {
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Results saved to {}", path.display());
        Ok(())
    }
}

/// Main experiment runner
pub struct Experiment {
    config: ExperimentConfig,
    model: ProbeModel,
}

impl Experiment {
    /// Create a new experiment
    pub fn new(model: ProbeModel, config: ExperimentConfig) -> Self {
        Self { config, model }
    }

    /// Run the full experiment on a raw word list
    pub fn run(&self, raw_words: &[String]) -> Result<ExperimentResults> {
        let config = &self.config;
        info!("Starting position probing experiment");
        info!("Config: {:?}", config);
        anyhow::ensure!(config.num_words >= 2, "num_words must be at least 2");
        anyhow::ensure!(config.epochs >= 1, "epochs must be at least 1");
        anyhow::ensure!(
            config.layer < self.model.n_layers(),
            "Probed layer {} out of range ({} layers)",
            config.layer,
            self.model.n_layers()
        );

        let mut rng = StdRng::seed_from_u64(config.seed);
        let tokenizer = self.model.tokenizer();

        let vocabulary = filter_vocabulary(raw_words, tokenizer, config.max_word_length + 1)
            .context("Vocabulary filtering")?;
        let (train_pool, test_pool) = vocabulary.split(config.train_fraction, &mut rng)?;

        let synthesizer = BatchSynthesizer::new(
            &config.prefix,
            config.num_words,
            config.max_word_length,
            tokenizer,
        )?;
        info!(
            "Prefix length {} tokens, sequence capacity {}",
            synthesizer.prefix_length(),
            synthesizer.capacity()
        );

        let layers = config.collected_layers(self.model.n_layers());
        let collector = ActivationCollector::new(&self.model, &layers)?;
        let mode = InferenceMode::enter();

        info!(
            "Collecting {} batches of {} for layers {:?}",
            config.epochs, config.batch_size, layers
        );
        let batches = (0..config.epochs).map(|i| -> Result<Batch> {
            let batch = synthesizer.gen_batch(tokenizer, config.batch_size, &train_pool, &mut rng)?;
            if i == 0 {
                batch.verify_alignment(tokenizer)?;
            }
            Ok(batch)
        });
        let store = collector.collect(batches, &mode)?;

        let trainer = config.trainer();
        let (probe, probe_results) = trainer
            .train_on_store(&store, config.layer, config.token_role, config.num_words, &mut rng)
            .with_context(|| format!("Probing layer {}", config.layer))?;
        info!(
            "Layer {} held-out accuracy: {:.2}%",
            config.layer,
            probe_results.accuracy() * 100.0
        );

        let mut layer_scan = Vec::new();
        let mut best_layer = config.layer;
        let mut best_accuracy = probe_results.accuracy();
        for &layer in &config.scan_layers {
            let results = if layer == config.layer {
                probe_results.clone()
            } else {
                trainer
                    .train_on_store(&store, layer, config.token_role, config.num_words, &mut rng)
                    .with_context(|| format!("Probing layer {layer}"))?
                    .1
            };
            info!("Layer {} accuracy: {:.2}%", layer, results.accuracy() * 100.0);
            if results.accuracy() > best_accuracy {
                best_accuracy = results.accuracy();
                best_layer = layer;
            }
            layer_scan.push(results);
        }
        drop(store);

        let predictions = evaluate(
            &self.model,
            &probe,
            &synthesizer,
            &test_pool,
            config.test_batches,
            config.batch_size,
            &mut rng,
            &mode,
        )?;
        let slot_accuracy = predictions.accuracy_by_index();

        Ok(ExperimentResults {
            model_id: self.model.model_id().to_string(),
            config: config.clone(),
            prefix_length: synthesizer.prefix_length(),
            collected_layers: collector.layers().to_vec(),
            train_bucket_sizes: train_pool.bucket_sizes(),
            test_bucket_sizes: test_pool.bucket_sizes(),
            probe: probe_results,
            layer_scan,
            best_layer,
            best_accuracy,
            slot_accuracy,
            predictions,
        })
    }
}
