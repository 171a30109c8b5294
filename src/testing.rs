//! In-crate fakes for unit tests
//!
//! `ChunkTokenizer` splits text at spaces (a space starts a new piece, as
//! GPT-2's pre-tokenizer does) and cuts each piece into 4-char chunks, so
//! joint tokenization of `prefix + " w1 w2 ..."` is exactly the
//! concatenation of the per-word tokenizations.
//!
//! `EchoBackend` stands in for a transformer: the residual at
//! (layer, row, position) is a one-hot of the position plus `0.01 * layer`.

use anyhow::Result;
use candle_core::{Device, Tensor};
use std::cell::RefCell;
use std::collections::HashMap;

use crate::cache::{ActivationCache, HookPoint};
use crate::model::{ProbeModel, ResidualBackend};
use crate::tokenizer::WordTokenizer;

const CHUNK_CHARS: usize = 4;

pub(crate) struct ChunkTokenizer {
    pieces: RefCell<Vec<String>>,
    ids: RefCell<HashMap<String, u32>>,
}

impl ChunkTokenizer {
    pub(crate) const BOS_ID: u32 = 0;

    pub(crate) fn new() -> Self {
        // 0 = start marker, 1 = filler; both decode to nothing
        Self {
            pieces: RefCell::new(vec![String::new(), String::new()]),
            ids: RefCell::new(HashMap::new()),
        }
    }

    fn intern(&self, chunk: String) -> u32 {
        if let Some(&id) = self.ids.borrow().get(&chunk) {
            return id;
        }
        let mut pieces = self.pieces.borrow_mut();
        let id = pieces.len() as u32;
        pieces.push(chunk.clone());
        self.ids.borrow_mut().insert(chunk, id);
        id
    }
}

fn split_at_spaces(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if c == ' ' && i > start {
            pieces.push(&text[start..i]);
            start = i;
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

impl WordTokenizer for ChunkTokenizer {
    fn encode(&self, text: &str, prepend_bos: bool) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if prepend_bos {
            ids.push(Self::BOS_ID);
        }
        for piece in split_at_spaces(text) {
            let chars: Vec<char> = piece.chars().collect();
            for chunk in chars.chunks(CHUNK_CHARS) {
                ids.push(self.intern(chunk.iter().collect()));
            }
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let pieces = self.pieces.borrow();
        ids.iter()
            .map(|&id| {
                pieces
                    .get(id as usize)
                    .cloned()
                    .ok_or_else(|| anyhow::anyhow!("Unknown token id {id}"))
            })
            .collect()
    }
}

/// Lowercase word of exactly `n_chars` letters derived from `index`
fn letters(index: usize, n_chars: usize) -> String {
    let mut value = index;
    (0..n_chars)
        .map(|_| {
            let c = (b'a' + (value % 26) as u8) as char;
            value /= 26;
            c
        })
        .collect()
}

/// `per_bucket` distinct words for each `ChunkTokenizer` length 1..=4.
///
/// Word lengths of 3, 7, 11 and 15 chars give token lengths 1, 2, 3, 4.
pub(crate) fn synthetic_words(per_bucket: usize) -> Vec<String> {
    (1..=4)
        .flat_map(|n_tokens| {
            let n_chars = CHUNK_CHARS * n_tokens - 1;
            (0..per_bucket).map(move |i| letters(i, n_chars))
        })
        .collect()
}

pub(crate) struct EchoBackend {
    n_layers: usize,
    d_model: usize,
}

impl EchoBackend {
    pub(crate) fn new(n_layers: usize, d_model: usize) -> Self {
        Self { n_layers, d_model }
    }

    fn layer_output(&self, layer: usize, batch: usize, seq_len: usize) -> Result<Tensor> {
        let d = self.d_model;
        let mut data = vec![0.01 * layer as f32; batch * seq_len * d];
        for b in 0..batch {
            for s in 0..seq_len {
                data[(b * seq_len + s) * d + s.min(d - 1)] += 1.0;
            }
        }
        Ok(Tensor::from_vec(data, (batch, seq_len, d), &Device::Cpu)?)
    }
}

impl ResidualBackend for EchoBackend {
    fn n_layers(&self) -> usize {
        self.n_layers
    }

    fn d_model(&self) -> usize {
        self.d_model
    }

    fn vocab_size(&self) -> usize {
        0
    }

    fn forward_with_cache(
        &self,
        input_ids: &Tensor,
        hooks: &[HookPoint],
    ) -> Result<(Tensor, ActivationCache)> {
        let (batch, seq_len) = input_ids.dims2()?;
        let mut cache = ActivationCache::new();
        let mut hidden = self.layer_output(0, batch, seq_len)?;
        for layer in 0..self.n_layers {
            hidden = self.layer_output(layer, batch, seq_len)?;
            let hook = HookPoint::ResidPost(layer);
            if hooks.contains(&hook) {
                cache.insert(hook, hidden.clone());
            }
        }
        Ok((hidden, cache))
    }
}

/// Echo model with 3 layers; `d_model` is wide enough for one-hot positions
pub(crate) fn echo_model() -> ProbeModel {
    ProbeModel::new(
        Box::new(EchoBackend::new(3, 40)),
        Box::new(ChunkTokenizer::new()),
        Device::Cpu,
        "echo",
    )
}
