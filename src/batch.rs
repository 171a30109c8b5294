//! Synthetic batch construction
//!
//! Every row is `prefix + " w1 w2 ... wN"` with words sampled from a
//! length-bucketed [`WordPool`]. Because each word's token length is known,
//! the absolute first/last token index of every word follows from a
//! cumulative sum over the sampled lengths, offset by the prefix length
//! (which includes the sequence-start marker).

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use ndarray::{s, Array2};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

use crate::tokenizer::WordTokenizer;
use crate::vocab::WordPool;

/// Token id written past each row's real length
pub const FILLER_TOKEN_ID: u32 = 1;

/// Absolute (first, last) token index of every word in a run.
///
/// `first[k] = prefix_length + sum(lengths[..k])` and
/// `last[k] = prefix_length + sum(lengths[..=k]) - 1`.
pub fn word_token_spans(word_lengths: &[usize], prefix_length: usize) -> (Vec<usize>, Vec<usize>) {
    let mut first = Vec::with_capacity(word_lengths.len());
    let mut last = Vec::with_capacity(word_lengths.len());
    let mut offset = prefix_length;
    for &len in word_lengths {
        first.push(offset);
        offset += len;
        last.push(offset - 1);
    }
    (first, last)
}

/// One sampled run of words
#[derive(Debug, Clone)]
pub struct SyntheticExample {
    pub words: Vec<String>,
    pub word_lengths: Vec<usize>,
    pub first_token_indices: Vec<usize>,
    pub last_token_indices: Vec<usize>,
}

impl SyntheticExample {
    /// The words joined with leading spaces, as appended to the prefix
    pub fn suffix(&self) -> String {
        self.words.iter().map(|w| format!(" {w}")).collect()
    }

    /// Total token count of the run
    pub fn n_tokens(&self) -> usize {
        self.word_lengths.iter().sum()
    }
}

/// A padded batch of synthetic runs with their index bookkeeping
#[derive(Debug, Clone)]
pub struct Batch {
    tokens: Array2<u32>,
    real_lengths: Vec<usize>,
    examples: Vec<SyntheticExample>,
    word_lengths: Array2<usize>,
    first_token_indices: Array2<usize>,
    last_token_indices: Array2<usize>,
}

impl Batch {
    /// Token matrix (batch, capacity), right-padded with [`FILLER_TOKEN_ID`]
    pub fn tokens(&self) -> &Array2<u32> {
        &self.tokens
    }

    /// Unpadded token count of each row
    pub fn real_lengths(&self) -> &[usize] {
        &self.real_lengths
    }

    pub fn examples(&self) -> &[SyntheticExample] {
        &self.examples
    }

    /// Word suffix string of each row
    pub fn suffixes(&self) -> Vec<String> {
        self.examples.iter().map(SyntheticExample::suffix).collect()
    }

    /// (batch, num_words)
    pub fn word_lengths(&self) -> &Array2<usize> {
        &self.word_lengths
    }

    /// (batch, num_words)
    pub fn first_token_indices(&self) -> &Array2<usize> {
        &self.first_token_indices
    }

    /// (batch, num_words)
    pub fn last_token_indices(&self) -> &Array2<usize> {
        &self.last_token_indices
    }

    pub fn batch_size(&self) -> usize {
        self.tokens.nrows()
    }

    pub fn num_words(&self) -> usize {
        self.word_lengths.ncols()
    }

    /// Token matrix as a (batch, capacity) u32 tensor
    pub fn tokens_tensor(&self, device: &Device) -> Result<Tensor> {
        let data = self
            .tokens
            .as_slice()
            .context("Token matrix is not in standard layout")?;
        Ok(Tensor::from_slice(data, self.tokens.dim(), device)?)
    }

    /// Decode every `[first, last]` slice and check it reproduces the
    /// sampled word.
    pub fn verify_alignment(&self, tokenizer: &dyn WordTokenizer) -> Result<()> {
        for (row, example) in self.examples.iter().enumerate() {
            for (slot, word) in example.words.iter().enumerate() {
                let first = self.first_token_indices[[row, slot]];
                let last = self.last_token_indices[[row, slot]];
                let ids: Vec<u32> = self.tokens.slice(s![row, first..=last]).to_vec();
                let decoded = tokenizer.decode(&ids)?;
                let decoded = decoded.strip_prefix(' ').unwrap_or(&decoded);
                anyhow::ensure!(
                    decoded == word,
                    "Row {row} slot {slot}: tokens {first}..={last} decode to {decoded:?}, expected {word:?}"
                );
            }
        }
        Ok(())
    }
}

/// Samples batches of word runs after a fixed prefix
#[derive(Debug, Clone)]
pub struct BatchSynthesizer {
    prefix: String,
    prefix_length: usize,
    num_words: usize,
    max_word_length: usize,
}

impl BatchSynthesizer {
    /// Precompute the prefix token length (with start marker)
    pub fn new(
        prefix: &str,
        num_words: usize,
        max_word_length: usize,
        tokenizer: &dyn WordTokenizer,
    ) -> Result<Self> {
        anyhow::ensure!(num_words >= 1, "num_words must be at least 1");
        anyhow::ensure!(max_word_length >= 1, "max_word_length must be at least 1");
        let prefix_length = tokenizer.encode(prefix, true)?.len();
        debug!("Prefix length: {prefix_length} tokens");
        Ok(Self {
            prefix: prefix.to_string(),
            prefix_length,
            num_words,
            max_word_length,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn prefix_length(&self) -> usize {
        self.prefix_length
    }

    pub fn num_words(&self) -> usize {
        self.num_words
    }

    pub fn max_word_length(&self) -> usize {
        self.max_word_length
    }

    /// Fixed row width: the longest possible run after the prefix
    pub fn capacity(&self) -> usize {
        self.prefix_length + self.max_word_length * self.num_words
    }

    /// Sample one run: a uniform length per slot, then a uniform word of
    /// that length.
    pub fn sample_example<R: Rng>(&self, pool: &WordPool, rng: &mut R) -> Result<SyntheticExample> {
        let mut words = Vec::with_capacity(self.num_words);
        let mut word_lengths = Vec::with_capacity(self.num_words);
        for _ in 0..self.num_words {
            let len = rng.gen_range(1..=self.max_word_length);
            let word = pool.bucket(len).choose(rng).with_context(|| {
                format!(
                    "Cannot sample a word of {len} token(s): bucket is empty (pool sizes {:?})",
                    pool.bucket_sizes()
                )
            })?;
            words.push(word.text().to_string());
            word_lengths.push(len);
        }

        let (first_token_indices, last_token_indices) =
            word_token_spans(&word_lengths, self.prefix_length);
        Ok(SyntheticExample {
            words,
            word_lengths,
            first_token_indices,
            last_token_indices,
        })
    }

    /// Sample and tokenize `batch_size` runs.
    ///
    /// Fails if a row's joint tokenization does not have exactly
    /// `prefix_length + sum(word lengths)` tokens.
    pub fn gen_batch<R: Rng>(
        &self,
        tokenizer: &dyn WordTokenizer,
        batch_size: usize,
        pool: &WordPool,
        rng: &mut R,
    ) -> Result<Batch> {
        anyhow::ensure!(batch_size >= 1, "batch_size must be at least 1");
        let examples = (0..batch_size)
            .map(|_| self.sample_example(pool, rng))
            .collect::<Result<Vec<_>>>()?;

        let texts: Vec<String> = examples
            .iter()
            .map(|example| format!("{}{}", self.prefix, example.suffix()))
            .collect();
        let encoded = tokenizer.encode_batch(&texts, true)?;

        let capacity = self.capacity();
        let n = self.num_words;
        let mut tokens = Array2::from_elem((batch_size, capacity), FILLER_TOKEN_ID);
        let mut word_lengths = Array2::zeros((batch_size, n));
        let mut first_token_indices = Array2::zeros((batch_size, n));
        let mut last_token_indices = Array2::zeros((batch_size, n));
        let mut real_lengths = Vec::with_capacity(batch_size);

        for (row, (example, ids)) in examples.iter().zip(&encoded).enumerate() {
            let expected = self.prefix_length + example.n_tokens();
            anyhow::ensure!(
                ids.len() == expected,
                "Row {row}: {:?} tokenized to {} tokens, expected {expected} \
                 (prefix {} + words {:?}); word boundaries would be misaligned",
                texts[row],
                ids.len(),
                self.prefix_length,
                example.word_lengths
            );
            anyhow::ensure!(
                ids.len() <= capacity,
                "Row {row}: {} tokens exceed capacity {capacity}",
                ids.len()
            );

            for (col, &id) in ids.iter().enumerate() {
                tokens[[row, col]] = id;
            }
            for slot in 0..n {
                word_lengths[[row, slot]] = example.word_lengths[slot];
                first_token_indices[[row, slot]] = example.first_token_indices[slot];
                last_token_indices[[row, slot]] = example.last_token_indices[slot];
            }
            real_lengths.push(ids.len());
        }

        Ok(Batch {
            tokens,
            real_lengths,
            examples,
            word_lengths,
            first_token_indices,
            last_token_indices,
        })
    }
}
