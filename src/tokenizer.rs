//! Tokenizer boundary for the probing pipeline
//!
//! The pipeline only needs two primitives from a tokenizer: encode text
//! (optionally with a sequence-start marker) and decode a token slice.
//! [`HfTokenizer`] provides them on top of a HuggingFace `tokenizer.json`.

use anyhow::{Context, Result};
use hf_hub::{api::sync::Api, Repo, RepoType};
use std::path::Path;
use tokenizers::Tokenizer;
use tracing::info;

/// Candidate names for the sequence-start marker, in lookup order
const BOS_CANDIDATES: [&str; 3] = ["<|endoftext|>", "<s>", "<bos>"];

/// Text ↔ token-index conversion used by the vocabulary filter and the
/// batch synthesizer.
pub trait WordTokenizer {
    /// Encode `text`, optionally prepending the sequence-start marker
    fn encode(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>>;

    /// Decode a token slice back to text
    fn decode(&self, ids: &[u32]) -> Result<String>;

    /// Encode several texts at once
    fn encode_batch(&self, texts: &[String], prepend_bos: bool) -> Result<Vec<Vec<u32>>> {
        texts
            .iter()
            .map(|text| self.encode(text, prepend_bos))
            .collect()
    }

    /// Token length of a word as it appears inside a run: `" " + word`,
    /// without a start marker.
    fn word_token_len(&self, word: &str) -> Result<usize> {
        Ok(self.encode(&format!(" {word}"), false)?.len())
    }
}

/// `tokenizers`-backed implementation
pub struct HfTokenizer {
    tokenizer: Tokenizer,
    bos_id: u32,
}

impl HfTokenizer {
    /// Download `tokenizer.json` for `model_id` from the HuggingFace hub
    pub fn from_pretrained(model_id: &str) -> Result<Self> {
        let api = Api::new()?;
        let repo = api.repo(Repo::new(model_id.to_string(), RepoType::Model));
        let tokenizer_path = repo
            .get("tokenizer.json")
            .context("Failed to download tokenizer.json")?;
        Self::from_file(tokenizer_path)
    }

    /// Load from a local `tokenizer.json`
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref())
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;

        let (bos_token, bos_id) = BOS_CANDIDATES
            .iter()
            .find_map(|name| tokenizer.token_to_id(name).map(|id| (*name, id)))
            .with_context(|| {
                format!(
                    "Tokenizer at {} has no sequence-start marker (tried {BOS_CANDIDATES:?})",
                    path.as_ref().display()
                )
            })?;
        info!("Sequence-start marker: {bos_token} (id {bos_id})");

        Ok(Self { tokenizer, bos_id })
    }

    pub fn bos_id(&self) -> u32 {
        self.bos_id
    }
}

impl WordTokenizer for HfTokenizer {
    fn encode(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))?;

        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if prepend_bos {
            ids.push(self.bos_id);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer
            .decode(ids, false)
            .map_err(|e| anyhow::anyhow!("Decode error: {e}"))
    }

    fn encode_batch(&self, texts: &[String], prepend_bos: bool) -> Result<Vec<Vec<u32>>> {
        let encodings = self
            .tokenizer
            .encode_batch(texts.to_vec(), false)
            .map_err(|e| anyhow::anyhow!("Batch tokenization error: {e}"))?;

        Ok(encodings
            .iter()
            .map(|encoding| {
                let mut ids = Vec::with_capacity(encoding.len() + 1);
                if prepend_bos {
                    ids.push(self.bos_id);
                }
                ids.extend_from_slice(encoding.get_ids());
                ids
            })
            .collect())
    }
}
