// Pedantic clippy configuration for ML/math codebase
// These are acceptable in numerical/ML code:
#![allow(clippy::cast_precision_loss)] // usize→f64/f32 intentional in ML
#![allow(clippy::cast_possible_truncation)] // usize→u32 in tensor indexing
#![allow(clippy::cast_possible_wrap)] // usize→i64 in tensor ops
#![allow(clippy::many_single_char_names)] // x, y, i, j standard in math
#![allow(clippy::similar_names)] // related variables like `first`/`firsts`
#![allow(clippy::module_name_repetitions)] // ProbeModel in model.rs is fine
// Documentation pedantic - acceptable for research code:
#![allow(clippy::doc_markdown)] // backticks for every technical term is excessive
#![allow(clippy::missing_errors_doc)] // # Errors section for every Result fn
#![allow(clippy::missing_panics_doc)] // # Panics section for every panic
// Method style pedantic:
#![allow(clippy::must_use_candidate)] // #[must_use] on every pure fn is excessive
#![allow(clippy::return_self_not_must_use)] // #[must_use] on Self returns
#![allow(clippy::needless_pass_by_value)] // value params for API flexibility
#![allow(clippy::cast_sign_loss)] // f64→usize when value is known positive

//! posprobe: word-position probing of transformer residual streams
//!
//! Measures how well each layer of a causal language model (GPT-2 small by
//! default) encodes the ordinal slot of a word within a run of random
//! words, independently of the word's token length.
//!
//! ## Architecture
//!
//! - `tokenizer`: `WordTokenizer` boundary over HuggingFace tokenizers
//! - `model`: `ProbeModel` wrapper and the `ResidualBackend` trait
//! - `forward_gpt2`: GPT-2 forward pass with `resid_post` capture hooks
//! - `cache`: typed hook points and the ActivationCache
//! - `vocab`: word-list loading and length-bucketed word pools
//! - `batch`: synthetic batch generation with word-position bookkeeping
//! - `collector`: activation gathering at first/last word tokens
//! - `probe`: linear probing with linfa for slot classification
//! - `report`: held-out evaluation, prediction table and histogram
//! - `experiment`: experiment runner coordinating the full pipeline

pub mod batch;
pub mod cache;
pub mod collector;
pub mod experiment;
pub mod forward_gpt2;
pub mod model;
pub mod probe;
pub mod report;
pub mod tokenizer;
pub mod vocab;

#[cfg(test)]
mod testing;

pub use batch::{word_token_spans, Batch, BatchSynthesizer, SyntheticExample, FILLER_TOKEN_ID};
pub use cache::{ActivationCache, HookPoint};
pub use collector::{
    gather_positions, ActivationCollector, ActivationRecord, ActivationStore, InferenceMode,
    TokenRole,
};
pub use experiment::{Experiment, ExperimentConfig, ExperimentResults, DEFAULT_PREFIX};
pub use forward_gpt2::{Gpt2Config, ProbeGpt2};
pub use model::{select_device, ProbeModel, ResidualBackend};
pub use probe::{
    ordinal_label, subsample_indices, train_test_split, ClassificationReport, PositionProbe,
    ProbeDataset, ProbeResults, ProbeTrainer, SubsamplePolicy,
};
pub use report::{evaluate, PredictionRecord, PredictionTable};
pub use tokenizer::{HfTokenizer, WordTokenizer};
pub use vocab::{filter_vocabulary, load_word_list, Word, WordPool};
