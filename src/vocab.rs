//! Word-list loading and length-bucketed word pools

use anyhow::{Context, Result};
use rand::Rng;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info};

use crate::tokenizer::WordTokenizer;

/// A vocabulary word with its token length (of `" " + text`, no start marker)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Word {
    text: String,
    n_tokens: usize,
}

impl Word {
    pub fn new(text: impl Into<String>, n_tokens: usize) -> Self {
        Self {
            text: text.into(),
            n_tokens,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }
}

/// Read a newline-delimited word list.
///
/// Blank lines are dropped and each word is trimmed.
pub fn load_word_list(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read word list {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Words grouped by token length; bucket `i` holds words of `i + 1` tokens
#[derive(Debug, Clone)]
pub struct WordPool {
    buckets: Vec<Vec<Word>>,
}

impl WordPool {
    /// Group `words` into buckets 1..=max_word_length.
    ///
    /// Words outside that range are rejected.
    pub fn from_words(words: Vec<Word>, max_word_length: usize) -> Result<Self> {
        anyhow::ensure!(max_word_length >= 1, "max_word_length must be at least 1");
        let mut buckets = vec![Vec::new(); max_word_length];
        for word in words {
            anyhow::ensure!(
                (1..=max_word_length).contains(&word.n_tokens),
                "Word {:?} has {} tokens, outside buckets 1..={max_word_length}",
                word.text,
                word.n_tokens
            );
            buckets[word.n_tokens - 1].push(word);
        }
        Ok(Self { buckets })
    }

    pub fn max_word_length(&self) -> usize {
        self.buckets.len()
    }

    /// Words of exactly `n_tokens` tokens (empty slice when out of range)
    pub fn bucket(&self, n_tokens: usize) -> &[Word] {
        n_tokens
            .checked_sub(1)
            .and_then(|i| self.buckets.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Word count per bucket, index 0 = 1-token words
    pub fn bucket_sizes(&self) -> Vec<usize> {
        self.buckets.iter().map(Vec::len).collect()
    }

    /// Total number of words
    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn words(&self) -> impl Iterator<Item = &Word> {
        self.buckets.iter().flatten()
    }

    /// Fail if any bucket is empty, since sampling from it would be impossible
    pub fn ensure_populated(&self, name: &str) -> Result<()> {
        for (i, bucket) in self.buckets.iter().enumerate() {
            anyhow::ensure!(
                !bucket.is_empty(),
                "{name} word pool has no words of {} token(s) (bucket sizes: {:?})",
                i + 1,
                self.bucket_sizes()
            );
        }
        Ok(())
    }

    /// Randomly split into (train, test) pools.
    ///
    /// Each word goes to train with probability `train_fraction`, so the two
    /// pools are disjoint and together hold every word. Both pools must keep
    /// every bucket populated.
    pub fn split<R: Rng>(&self, train_fraction: f64, rng: &mut R) -> Result<(Self, Self)> {
        anyhow::ensure!(
            (0.0..=1.0).contains(&train_fraction),
            "train_fraction {train_fraction} outside [0, 1]"
        );
        let n = self.max_word_length();
        let mut train = vec![Vec::new(); n];
        let mut test = vec![Vec::new(); n];

        for (i, bucket) in self.buckets.iter().enumerate() {
            for word in bucket {
                if rng.gen::<f64>() < train_fraction {
                    train[i].push(word.clone());
                } else {
                    test[i].push(word.clone());
                }
            }
        }

        let train = Self { buckets: train };
        let test = Self { buckets: test };
        info!("Train pool bucket sizes: {:?}", train.bucket_sizes());
        info!("Test pool bucket sizes: {:?}", test.bucket_sizes());
        train.ensure_populated("Train")?;
        test.ensure_populated("Test")?;
        Ok((train, test))
    }
}

/// Tokenize each word, keep those shorter than `max_token_length` tokens,
/// and bucket them.
///
/// Buckets cover 1..max_token_length (exclusive); every one of them must be
/// populated. Duplicate words are kept once.
pub fn filter_vocabulary(
    raw_words: &[String],
    tokenizer: &dyn WordTokenizer,
    max_token_length: usize,
) -> Result<WordPool> {
    anyhow::ensure!(
        max_token_length >= 2,
        "max_token_length {max_token_length} leaves no length bucket"
    );

    let mut seen = HashSet::new();
    let mut kept = Vec::new();
    let mut discarded = 0;
    for raw in raw_words {
        let text = raw.trim();
        if text.is_empty() || !seen.insert(text) {
            continue;
        }
        let n_tokens = tokenizer
            .word_token_len(text)
            .with_context(|| format!("Failed to tokenize word {text:?}"))?;
        if n_tokens < max_token_length {
            kept.push(Word::new(text, n_tokens));
        } else {
            discarded += 1;
        }
    }
    debug!(
        "Vocabulary filter kept {} words, discarded {discarded}",
        kept.len()
    );

    let pool = WordPool::from_words(kept, max_token_length - 1)?;
    info!(
        "Filtered vocabulary: {} words, bucket sizes {:?}",
        pool.len(),
        pool.bucket_sizes()
    );
    pool.ensure_populated("Filtered")?;
    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{synthetic_words, ChunkTokenizer};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_filter_keeps_words_below_max_length() {
        let tok = ChunkTokenizer::new();
        let words = synthetic_words(20);
        let pool = filter_vocabulary(&words, &tok, 4).unwrap();

        // the 4-token bucket of synthetic_words is dropped
        assert_eq!(pool.len(), 60);
        assert_eq!(pool.bucket_sizes(), vec![20, 20, 20]);
        for word in pool.words() {
            assert!(word.n_tokens() < 4);
            assert_eq!(tok.word_token_len(word.text()).unwrap(), word.n_tokens());
        }
    }

    #[test]
    fn test_filter_skips_blanks_and_duplicates() {
        let tok = ChunkTokenizer::new();
        let words: Vec<String> = ["abc", "", "  ", "abc", "abcdefg", " abc "]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let pool = filter_vocabulary(&words, &tok, 3).unwrap();
        assert_eq!(pool.bucket_sizes(), vec![1, 1]);
    }

    #[test]
    fn test_filter_reports_empty_bucket() {
        let tok = ChunkTokenizer::new();
        // only 1-token words: the 2- and 3-token buckets stay empty
        let words: Vec<String> = vec!["cat".into(), "dog".into()];
        let err = filter_vocabulary(&words, &tok, 4).unwrap_err();
        assert!(err.to_string().contains("2 token(s)"));
    }

    #[test]
    fn test_split_is_disjoint_and_complete() {
        let tok = ChunkTokenizer::new();
        let pool = filter_vocabulary(&synthetic_words(50), &tok, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        let (train, test) = pool.split(0.8, &mut rng).unwrap();

        let train_set: HashSet<&str> = train.words().map(Word::text).collect();
        let test_set: HashSet<&str> = test.words().map(Word::text).collect();
        let all: HashSet<&str> = pool.words().map(Word::text).collect();

        assert!(train_set.is_disjoint(&test_set));
        let union: HashSet<&str> = train_set.union(&test_set).copied().collect();
        assert_eq!(union, all);
        assert_eq!(train.len() + test.len(), pool.len());
    }

    #[test]
    fn test_split_rejects_starved_test_pool() {
        let tok = ChunkTokenizer::new();
        let pool = filter_vocabulary(&synthetic_words(5), &tok, 4).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let err = pool.split(1.0, &mut rng).unwrap_err();
        assert!(err.to_string().contains("Test word pool"));
    }

    #[test]
    fn test_bucket_out_of_range_is_empty() {
        let pool = WordPool::from_words(vec![Word::new("a", 1)], 2).unwrap();
        assert!(pool.bucket(0).is_empty());
        assert!(pool.bucket(3).is_empty());
        assert_eq!(pool.bucket(1).len(), 1);
        assert!(WordPool::from_words(vec![Word::new("a", 3)], 2).is_err());
    }
}
