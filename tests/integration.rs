//! Integration tests for posprobe
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use posprobe::{
    load_word_list, train_test_split, word_token_spans, ExperimentConfig, SubsamplePolicy,
    TokenRole,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashSet;
use std::io::Write;
use tempfile::NamedTempFile;

/// Test word list loading
#[test]
fn test_word_list_loading() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "the\n  of \n\nand\r\nbecause\n").unwrap();

    let words = load_word_list(file.path()).unwrap();
    assert_eq!(words, vec!["the", "of", "and", "because"]);
}

#[test]
fn test_missing_word_list_names_path() {
    let err = load_word_list("/nonexistent/words.txt").unwrap_err();
    assert!(format!("{err:#}").contains("/nonexistent/words.txt"));
}

/// Test the bundled word list is usable
#[test]
fn test_bundled_word_list() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/data/common_words.txt");
    let words = load_word_list(path).unwrap();
    assert!(words.len() > 200);
    assert!(words.iter().all(|w| !w.contains(' ')));
}

/// Test experiment config defaults
#[test]
fn test_experiment_config_defaults() {
    let config = ExperimentConfig::default();
    assert_eq!(config.train_fraction, 0.8);
    assert_eq!(config.seed, 42);
    assert_eq!(config.num_words, 7);
    assert_eq!(config.test_fraction, 0.1);
    assert!(config.scan_layers.is_empty());
    assert!(config.collect_layers.is_empty());
    assert_eq!(config.subsample_policy, SubsamplePolicy::Permutation);
}

/// Test config file overrides
#[test]
fn test_experiment_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"{{"layer": 3, "scan_layers": [0, 6, 11], "token_role": "first", "epochs": 5}}"#
    )
    .unwrap();

    let config = ExperimentConfig::from_json_file(file.path()).unwrap();
    assert_eq!(config.layer, 3);
    assert_eq!(config.scan_layers, vec![0, 6, 11]);
    assert_eq!(config.token_role, TokenRole::First);
    assert_eq!(config.epochs, 5);
    assert_eq!(config.batch_size, 256);
    assert_eq!(config.collected_layers(12), (0..12).collect::<Vec<_>>());
}

#[test]
fn test_invalid_config_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"layer": "zero"}}"#).unwrap();
    assert!(ExperimentConfig::from_json_file(file.path()).is_err());
}

/// Test word span arithmetic
#[test]
fn test_word_token_spans() {
    let (first, last) = word_token_spans(&[1, 3, 2], 20);
    assert_eq!(first, vec![20, 21, 24]);
    assert_eq!(last, vec![20, 23, 25]);
}

/// Test train/test split sizes
#[test]
fn test_train_test_split() {
    let indices: Vec<usize> = (0..1000).collect();
    let mut rng = StdRng::seed_from_u64(42);
    let (train, test) = train_test_split(&indices, 0.1, &mut rng);

    assert_eq!(train.len(), 900);
    assert_eq!(test.len(), 100);
    let train: HashSet<usize> = train.into_iter().collect();
    assert!(test.iter().all(|i| !train.contains(i)));
}

/// Model-dependent test: model loading
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    use posprobe::ProbeModel;

    let model = ProbeModel::from_pretrained_with_device("openai-community/gpt2", Some(true)).unwrap();
    assert_eq!(model.n_layers(), 12);
    assert_eq!(model.d_model(), 768);
    assert_eq!(model.vocab_size(), 50257);
}

/// Model-dependent test: GPT-2 tokenization of words and prefix
#[test]
#[ignore = "requires model download"]
fn test_gpt2_tokenizer() {
    use posprobe::{HfTokenizer, WordTokenizer};

    let tokenizer = HfTokenizer::from_pretrained("openai-community/gpt2").unwrap();
    assert_eq!(tokenizer.bos_id(), 50256);
    assert_eq!(tokenizer.word_token_len("the").unwrap(), 1);

    let ids = tokenizer.encode("Hello world", true).unwrap();
    assert_eq!(ids[0], 50256);
    assert_eq!(tokenizer.decode(&ids[1..]).unwrap(), "Hello world");
}

/// Model-dependent test: short end-to-end run on the bundled word list
#[test]
#[ignore = "requires model download"]
fn test_small_experiment() {
    use posprobe::{Experiment, ProbeModel};

    let model = ProbeModel::from_pretrained_with_device("openai-community/gpt2", Some(true)).unwrap();
    let words =
        load_word_list(concat!(env!("CARGO_MANIFEST_DIR"), "/data/common_words.txt")).unwrap();
    let config = ExperimentConfig {
        batch_size: 16,
        epochs: 4,
        test_batches: 2,
        scan_layers: vec![0, 11],
        ..Default::default()
    };

    let results = Experiment::new(model, config).run(&words).unwrap();
    assert_eq!(results.predictions.len(), 2 * 16 * 7);
    assert_eq!(results.layer_scan.len(), 2);
    assert_eq!(results.collected_layers.len(), 12);
    assert!(results.probe.accuracy() > 0.0);
}
