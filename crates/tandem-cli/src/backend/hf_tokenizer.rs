//! Hugging Face `tokenizer.json` binding

use std::path::Path;
use tandem_core::{tokenizer::Tokenizer, CoreError, Result};
use tracing::debug;

const BOS_CANDIDATES: [&str; 2] = ["<s>", "<|begin_of_text|>"];
const EOS_CANDIDATES: [&str; 3] = ["</s>", "<|end_of_text|>", "<|endoftext|>"];

/// First special token present in the vocabulary
fn resolve_special(lookup: impl Fn(&str) -> Option<u32>, candidates: &[&str]) -> Option<u32> {
    candidates.iter().find_map(|token| lookup(token))
}

pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos: Option<u32>,
    eos: Option<u32>,
}

impl HfTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            CoreError::tokenizer(
                "TOKENIZER_LOAD",
                e.to_string(),
                format!("Loading {}", path.display()),
                "Point model.tokenizer_path at a tokenizer.json file",
            )
        })?;
        let bos = resolve_special(|t| inner.token_to_id(t), &BOS_CANDIDATES);
        let eos = resolve_special(|t| inner.token_to_id(t), &EOS_CANDIDATES);
        debug!(?bos, ?eos, vocab = inner.get_vocab_size(true), "Tokenizer loaded");
        Ok(Self { inner, bos, eos })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> Result<Vec<u32>> {
        let encoding = self.inner.encode(text, false).map_err(encode_failed)?;
        let mut ids = Vec::with_capacity(encoding.len() + 1);
        if add_bos {
            ids.extend(self.bos);
        }
        ids.extend_from_slice(encoding.get_ids());
        Ok(ids)
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        self.inner.decode(tokens, true).map_err(decode_failed)
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos
    }
}

fn encode_failed(err: impl std::fmt::Display) -> CoreError {
    CoreError::tokenizer(
        "TOKENIZER_ENCODE",
        err.to_string(),
        "Encoding prompt",
        "Check the prompt text and that tokenizer.json matches the model",
    )
}

fn decode_failed(err: impl std::fmt::Display) -> CoreError {
    CoreError::tokenizer(
        "TOKENIZER_DECODE",
        err.to_string(),
        "Decoding output",
        "Use the tokenizer.json shipped with the checkpoint so token ids are in range",
    )
}
