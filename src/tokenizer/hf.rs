//! Hugging Face `tokenizer.json` support.

use std::path::Path;

use super::Tokenizer;
use crate::TokenId;

const BOS_CANDIDATES: &[&str] = &["<s>", "<|begin_of_text|>", "<bos>", "<|startoftext|>"];
const EOS_CANDIDATES: &[&str] = &[
    "</s>",
    "<|end_of_text|>",
    "<|eot_id|>",
    "<eos>",
    "<|endoftext|>",
    "<|im_end|>",
];
const PAD_CANDIDATES: &[&str] = &["<pad>", "<|pad|>", "[PAD]"];

/// Tokenizer backed by the `tokenizers` crate (BPE, WordPiece, Unigram, ...).
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
    bos: Option<TokenId>,
    eos: Option<TokenId>,
    pad: Option<TokenId>,
}

impl HfTokenizer {
    /// Load a tokenizer.json file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| {
            crate::EmbeeError::Tokenizer(format!("failed to load {}: {}", path.display(), e))
        })?;
        Ok(Self::from_inner(inner))
    }

    /// Parse tokenizer.json contents
    pub fn from_bytes(bytes: impl AsRef<[u8]>) -> crate::Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| crate::EmbeeError::Tokenizer(e.to_string()))?;
        Ok(Self::from_inner(inner))
    }

    fn from_inner(inner: tokenizers::Tokenizer) -> Self {
        let lookup = |candidates: &[&str]| {
            candidates
                .iter()
                .find_map(|name| inner.token_to_id(name))
                .and_then(|id| TokenId::try_from(id).ok())
        };

        let bos = lookup(BOS_CANDIDATES);
        let eos = lookup(EOS_CANDIDATES);
        let pad = lookup(PAD_CANDIDATES);
        tracing::debug!(?bos, ?eos, ?pad, "resolved special tokens");

        Self { inner, bos, eos, pad }
    }

    /// Override the end-of-sequence token
    pub fn with_eos_token(mut self, eos: Option<TokenId>) -> Self {
        self.eos = eos;
        self
    }

    /// Override the beginning-of-sequence token
    pub fn with_bos_token(mut self, bos: Option<TokenId>) -> Self {
        self.bos = bos;
        self
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> crate::Result<Vec<TokenId>> {
        let encoding = self
            .inner
            .encode(text, true)
            .map_err(|e| crate::EmbeeError::TokenizationFailure(e.to_string()))?;

        encoding
            .get_ids()
            .iter()
            .map(|&id| {
                TokenId::try_from(id).map_err(|_| {
                    crate::EmbeeError::TokenizationFailure(format!("token id {id} overflows"))
                })
            })
            .collect()
    }

    fn decode(&self, tokens: &[TokenId]) -> crate::Result<String> {
        let ids = tokens
            .iter()
            .map(|&token| {
                u32::try_from(token).map_err(|_| crate::EmbeeError::OutOfVocabularyToken {
                    token,
                    vocab_size: self.vocab_size(),
                })
            })
            .collect::<crate::Result<Vec<u32>>>()?;

        self.inner
            .decode(&ids, true)
            .map_err(|e| crate::EmbeeError::Tokenizer(format!("decoding failed: {e}")))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.bos
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.eos
    }

    fn pad_token(&self) -> Option<TokenId> {
        self.pad
    }
}
