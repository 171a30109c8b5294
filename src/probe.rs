//! Linear probing with linfa for word-position classification
//!
//! Trains a multiclass logistic regression mapping one layer's activation
//! vector to the word's ordinal slot (0..num_words) in its synthetic run.

use anyhow::{Context, Result};
use linfa::prelude::*;
use linfa_logistic::{MultiFittedLogisticRegression, MultiLogisticRegression};
use ndarray::{Array1, Array2, Axis};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::collector::{ActivationStore, TokenRole};

/// Ordinal label of the word at (`batch_index`, `row_index`, `slot_index`).
///
/// The label is the slot itself; batch and row are accepted so callers never
/// derive labels from flattening order.
pub fn ordinal_label(_batch_index: usize, _row_index: usize, slot_index: usize) -> usize {
    slot_index
}

/// How training examples are drawn from the flattened activations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsamplePolicy {
    /// One random permutation truncated to the cap
    Permutation,
    /// Intersection of two independent capped permutations.
    ///
    /// Features and labels are built in lockstep, so this keeps only the
    /// indices that happen to be drawn twice (roughly cap²/n of them).
    IntersectIndependent,
}

fn capped_permutation<R: Rng>(n: usize, cap: usize, rng: &mut R) -> Vec<usize> {
    let mut idx: Vec<usize> = (0..n).collect();
    idx.shuffle(rng);
    idx.truncate(cap);
    idx
}

/// Pick at most `cap` distinct indices from `0..n`
pub fn subsample_indices<R: Rng>(
    n: usize,
    cap: usize,
    policy: SubsamplePolicy,
    rng: &mut R,
) -> Vec<usize> {
    match policy {
        SubsamplePolicy::Permutation => capped_permutation(n, cap, rng),
        SubsamplePolicy::IntersectIndependent => {
            let x_indices: BTreeSet<usize> = capped_permutation(n, cap, rng).into_iter().collect();
            let y_indices: BTreeSet<usize> = capped_permutation(n, cap, rng).into_iter().collect();
            let common: Vec<usize> = x_indices.intersection(&y_indices).copied().collect();
            warn!(
                "Intersected subsample kept {} of {} drawn indices",
                common.len(),
                x_indices.len()
            );
            common
        }
    }
}

/// Shuffle `indices` and split off `ceil(n * test_fraction)` for testing.
///
/// Returns (train, test).
pub fn train_test_split<R: Rng>(
    indices: &[usize],
    test_fraction: f64,
    rng: &mut R,
) -> (Vec<usize>, Vec<usize>) {
    let mut shuffled = indices.to_vec();
    shuffled.shuffle(rng);
    let n_test = ((shuffled.len() as f64) * test_fraction).ceil() as usize;
    let n_test = n_test.min(shuffled.len());
    let train = shuffled.split_off(n_test);
    (train, shuffled)
}

/// Feature matrix with ordinal labels, rows aligned by construction
#[derive(Debug, Clone)]
pub struct ProbeDataset {
    features: Array2<f64>,
    labels: Array1<usize>,
}

impl ProbeDataset {
    pub fn new(features: Array2<f64>, labels: Array1<usize>) -> Result<Self> {
        anyhow::ensure!(
            features.nrows() == labels.len(),
            "{} feature rows but {} labels",
            features.nrows(),
            labels.len()
        );
        Ok(Self { features, labels })
    }

    /// Flatten one layer of every accumulated record
    pub fn from_store(store: &ActivationStore, layer: usize, role: TokenRole) -> Result<Self> {
        anyhow::ensure!(!store.is_empty(), "No activations collected");

        let mut rows = Vec::new();
        let mut labels = Vec::new();
        let mut d_model = 0;
        for (batch_index, record) in store.records().iter().enumerate() {
            let matrix = record
                .layer_matrix(layer, role)
                .with_context(|| format!("Batch {batch_index}"))?;
            let num_words = record.num_words()?;
            d_model = matrix.ncols();

            for (i, vector) in matrix.axis_iter(Axis(0)).enumerate() {
                let (row_index, slot_index) = (i / num_words, i % num_words);
                labels.push(ordinal_label(batch_index, row_index, slot_index));
                rows.extend(vector.iter().map(|&v| f64::from(v)));
            }
        }

        let features = Array2::from_shape_vec((labels.len(), d_model), rows)
            .context("Failed to create feature matrix")?;
        Self::new(features, Array1::from(labels))
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn features(&self) -> &Array2<f64> {
        &self.features
    }

    pub fn labels(&self) -> &Array1<usize> {
        &self.labels
    }

    /// Rows at `indices`, in that order
    pub fn select(&self, indices: &[usize]) -> (Array2<f64>, Array1<usize>) {
        (
            self.features.select(Axis(0), indices),
            self.labels.select(Axis(0), indices),
        )
    }
}

/// Per-class precision/recall/F1
#[derive(Debug, Clone, Serialize)]
pub struct ClassMetrics {
    pub class: usize,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Classification report over `num_classes` labels
#[derive(Debug, Clone, Serialize)]
pub struct ClassificationReport {
    pub classes: Vec<ClassMetrics>,
    pub accuracy: f64,
    pub correct: usize,
    pub total: usize,
}

fn ratio(num: usize, denom: usize) -> f64 {
    if denom == 0 {
        0.0
    } else {
        num as f64 / denom as f64
    }
}

impl ClassificationReport {
    pub fn from_predictions(predictions: &[usize], labels: &[usize], num_classes: usize) -> Self {
        let mut tp = vec![0usize; num_classes];
        let mut predicted = vec![0usize; num_classes];
        let mut support = vec![0usize; num_classes];

        for (&pred, &label) in predictions.iter().zip(labels) {
            if label < num_classes {
                support[label] += 1;
            }
            if pred < num_classes {
                predicted[pred] += 1;
            }
            if pred == label && label < num_classes {
                tp[label] += 1;
            }
        }

        let classes = (0..num_classes)
            .map(|class| {
                let precision = ratio(tp[class], predicted[class]);
                let recall = ratio(tp[class], support[class]);
                let f1 = if precision + recall == 0.0 {
                    0.0
                } else {
                    2.0 * precision * recall / (precision + recall)
                };
                ClassMetrics {
                    class,
                    precision,
                    recall,
                    f1,
                    support: support[class],
                }
            })
            .collect();

        let correct = predictions
            .iter()
            .zip(labels)
            .filter(|(p, l)| p == l)
            .count();
        let total = predictions.len();

        Self {
            classes,
            accuracy: ratio(correct, total),
            correct,
            total,
        }
    }

    /// Unweighted mean F1 over classes
    pub fn macro_f1(&self) -> f64 {
        if self.classes.is_empty() {
            return 0.0;
        }
        self.classes.iter().map(|c| c.f1).sum::<f64>() / self.classes.len() as f64
    }
}

impl fmt::Display for ClassificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:>8} {:>10} {:>10} {:>10} {:>10}",
            "class", "precision", "recall", "f1-score", "support"
        )?;
        for c in &self.classes {
            writeln!(
                f,
                "{:>8} {:>10.2} {:>10.2} {:>10.2} {:>10}",
                c.class, c.precision, c.recall, c.f1, c.support
            )?;
        }
        writeln!(
            f,
            "{:>8} {:>10} {:>10} {:>10.2} {:>10}",
            "accuracy", "", "", self.accuracy, self.total
        )?;
        write!(
            f,
            "{:>8} {:>10} {:>10} {:>10.2} {:>10}",
            "macro f1", "", "", self.macro_f1(), self.total
        )
    }
}

/// Train/test metrics of a fitted probe
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResults {
    pub layer: usize,
    pub role: TokenRole,
    pub n_train: usize,
    pub n_test: usize,
    pub train: ClassificationReport,
    pub test: ClassificationReport,
}

impl ProbeResults {
    /// Held-out accuracy
    pub fn accuracy(&self) -> f64 {
        self.test.accuracy
    }
}

/// A fitted position classifier for one layer
pub struct PositionProbe {
    model: MultiFittedLogisticRegression<f64, usize>,
    layer: usize,
    role: TokenRole,
}

impl PositionProbe {
    pub fn layer(&self) -> usize {
        self.layer
    }

    pub fn role(&self) -> TokenRole {
        self.role
    }

    /// Predict ordinal slots for (n, d_model) features
    pub fn predict(&self, features: &Array2<f64>) -> Array1<usize> {
        self.model.predict(features)
    }

    /// Predict from F32 activations
    pub fn predict_f32(&self, features: &Array2<f32>) -> Array1<usize> {
        self.predict(&features.mapv(f64::from))
    }
}

/// Trainer for position probes
#[derive(Debug, Clone)]
pub struct ProbeTrainer {
    max_iterations: u64,
    inverse_regularization: f64,
    sample_cap: usize,
    test_fraction: f64,
    policy: SubsamplePolicy,
}

impl ProbeTrainer {
    pub fn new() -> Self {
        Self {
            max_iterations: 100,
            inverse_regularization: 1.0,
            sample_cap: 10_000,
            test_fraction: 0.1,
            policy: SubsamplePolicy::Permutation,
        }
    }

    pub fn max_iterations(mut self, max_iterations: u64) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Inverse L2 strength C; the penalty passed to linfa is `1 / C`
    pub fn inverse_regularization(mut self, c: f64) -> Self {
        self.inverse_regularization = c;
        self
    }

    pub fn sample_cap(mut self, sample_cap: usize) -> Self {
        self.sample_cap = sample_cap;
        self
    }

    pub fn test_fraction(mut self, test_fraction: f64) -> Self {
        self.test_fraction = test_fraction;
        self
    }

    pub fn policy(mut self, policy: SubsamplePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Build the dataset for `layer` from accumulated records and train on it
    pub fn train_on_store<R: Rng>(
        &self,
        store: &ActivationStore,
        layer: usize,
        role: TokenRole,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<(PositionProbe, ProbeResults)> {
        let dataset = ProbeDataset::from_store(store, layer, role)?;
        self.train(&dataset, layer, role, num_classes, rng)
    }

    /// Subsample, split, fit and evaluate
    pub fn train<R: Rng>(
        &self,
        dataset: &ProbeDataset,
        layer: usize,
        role: TokenRole,
        num_classes: usize,
        rng: &mut R,
    ) -> Result<(PositionProbe, ProbeResults)> {
        anyhow::ensure!(
            self.inverse_regularization > 0.0,
            "Inverse regularization must be positive"
        );

        let selected = subsample_indices(dataset.len(), self.sample_cap, self.policy, rng);
        let (train_idx, test_idx) = train_test_split(&selected, self.test_fraction, rng);
        anyhow::ensure!(
            !test_idx.is_empty(),
            "Empty test split ({} selected examples)",
            selected.len()
        );

        let (train_x, train_y) = dataset.select(&train_idx);
        let (test_x, test_y) = dataset.select(&test_idx);

        let distinct: BTreeSet<usize> = train_y.iter().copied().collect();
        anyhow::ensure!(
            distinct.len() >= num_classes,
            "Degenerate training split for layer {layer}: {} distinct labels {:?}, need {num_classes}",
            distinct.len(),
            distinct
        );

        debug!(
            "Training probe: {} samples, {} features",
            train_x.nrows(),
            train_x.ncols()
        );

        let train_dataset = Dataset::new(train_x.clone(), train_y.clone());
        let model = MultiLogisticRegression::default()
            .alpha(1.0 / self.inverse_regularization)
            .max_iterations(self.max_iterations)
            .fit(&train_dataset)
            .context("Failed to train logistic regression")?;

        let train_pred: Array1<usize> = model.predict(&train_x);
        let test_pred: Array1<usize> = model.predict(&test_x);

        let train = ClassificationReport::from_predictions(
            train_pred.as_slice().context("Non-contiguous predictions")?,
            train_y.as_slice().context("Non-contiguous labels")?,
            num_classes,
        );
        let test = ClassificationReport::from_predictions(
            test_pred.as_slice().context("Non-contiguous predictions")?,
            test_y.as_slice().context("Non-contiguous labels")?,
            num_classes,
        );
        info!(
            "Layer {layer} probe: train accuracy {:.2}%, test accuracy {:.2}%",
            train.accuracy * 100.0,
            test.accuracy * 100.0
        );

        let results = ProbeResults {
            layer,
            role,
            n_train: train_idx.len(),
            n_test: test_idx.len(),
            train,
            test,
        };
        let probe = PositionProbe { model, layer, role };
        Ok((probe, results))
    }
}

impl Default for ProbeTrainer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;

    /// `per_class` copies of a one-hot vector per class, lightly jittered
    fn separable_dataset(num_classes: usize, per_class: usize) -> ProbeDataset {
        let d = num_classes + 1;
        let n = num_classes * per_class;
        let mut features = Array2::zeros((n, d));
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % num_classes;
            features[[i, class]] = 1.0;
            features[[i, d - 1]] = (i % 5) as f64 * 0.01;
            labels.push(class);
        }
        ProbeDataset::new(features, Array1::from(labels)).unwrap()
    }

    #[test]
    fn test_ordinal_label_is_slot() {
        assert_eq!(ordinal_label(0, 0, 0), 0);
        assert_eq!(ordinal_label(3, 17, 6), 6);
        assert_eq!(ordinal_label(9, 0, 2), ordinal_label(0, 9, 2));
    }

    #[test]
    fn test_report_metrics() {
        let labels = [0, 0, 1, 1, 2, 2];
        let preds = [0, 1, 1, 1, 2, 0];
        let report = ClassificationReport::from_predictions(&preds, &labels, 3);

        assert_eq!(report.correct, 4);
        assert_eq!(report.total, 6);
        assert!((report.accuracy - 4.0 / 6.0).abs() < 1e-9);
        // class 1: predicted 3 times, 2 correct, support 2
        assert!((report.classes[1].precision - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.classes[1].recall - 1.0).abs() < 1e-9);
        assert!((report.classes[1].f1 - 0.8).abs() < 1e-9);
        assert_eq!(report.classes[2].support, 2);
        assert!(report.to_string().contains("precision"));
    }

    #[test]
    fn test_report_handles_unpredicted_class() {
        let report = ClassificationReport::from_predictions(&[0, 0], &[0, 1], 3);
        assert_eq!(report.classes[1].precision, 0.0);
        assert_eq!(report.classes[2].f1, 0.0);
        assert_eq!(report.classes[2].support, 0);
    }

    #[test]
    fn test_permutation_subsample_is_distinct_and_capped() {
        let mut rng = StdRng::seed_from_u64(0);
        let idx = subsample_indices(500, 100, SubsamplePolicy::Permutation, &mut rng);
        assert_eq!(idx.len(), 100);
        assert_eq!(idx.iter().collect::<HashSet<_>>().len(), 100);
        assert!(idx.iter().all(|&i| i < 500));

        let idx = subsample_indices(50, 100, SubsamplePolicy::Permutation, &mut rng);
        assert_eq!(idx.len(), 50);
    }

    #[test]
    fn test_intersect_subsample_keeps_only_overlap() {
        let mut rng = StdRng::seed_from_u64(1);
        let idx = subsample_indices(1000, 100, SubsamplePolicy::IntersectIndependent, &mut rng);
        assert!(idx.len() <= 100);
        assert!(idx.windows(2).all(|w| w[0] < w[1]));

        // with the cap covering everything both draws are the full range
        let idx = subsample_indices(40, 100, SubsamplePolicy::IntersectIndependent, &mut rng);
        assert_eq!(idx, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn test_split_sizes_and_disjointness() {
        let mut rng = StdRng::seed_from_u64(2);
        for n in [10usize, 97, 100, 1234] {
            let indices: Vec<usize> = (0..n).collect();
            let (train, test) = train_test_split(&indices, 0.1, &mut rng);

            let expected = n as f64 * 0.9;
            assert!((train.len() as f64 - expected).abs() <= 1.0, "n={n}");
            assert_eq!(train.len() + test.len(), n);

            let train_set: HashSet<_> = train.iter().collect();
            assert!(test.iter().all(|i| !train_set.contains(i)));
        }
    }

    #[test]
    fn test_separable_features_are_learned() {
        let dataset = separable_dataset(7, 100);
        let mut rng = StdRng::seed_from_u64(42);
        let (probe, results) = ProbeTrainer::new()
            .train(&dataset, 0, TokenRole::Last, 7, &mut rng)
            .unwrap();

        assert!(results.accuracy() >= 0.99, "accuracy {}", results.accuracy());
        assert_eq!(results.n_train + results.n_test, 700);
        assert!((70..=71).contains(&results.n_test));
        assert_eq!(probe.layer(), 0);

        let mut probe_x = Array2::<f32>::zeros((2, 8));
        probe_x[[0, 3]] = 1.0;
        probe_x[[1, 6]] = 1.0;
        assert_eq!(probe.predict_f32(&probe_x).to_vec(), vec![3, 6]);
    }

    #[test]
    fn test_degenerate_labels_fail() {
        let dataset = separable_dataset(3, 50);
        let mut rng = StdRng::seed_from_u64(0);
        let err = ProbeTrainer::new()
            .train(&dataset, 4, TokenRole::Last, 7, &mut rng)
            .err()
            .unwrap();
        assert!(err.to_string().contains("Degenerate"));
    }

    #[test]
    fn test_dataset_shape_mismatch() {
        let features = Array2::<f64>::zeros((3, 2));
        assert!(ProbeDataset::new(features, Array1::from(vec![0, 1])).is_err());
    }
}
