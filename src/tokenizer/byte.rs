//! Byte-level tokenizer: one token per UTF-8 byte.

use super::Tokenizer;
use crate::TokenId;

const BYTE_VOCAB_SIZE: usize = 256;

/// Maps every byte of the input to its own token id.
///
/// Needs no vocabulary file, which makes it the fallback for models shipped
/// without a tokenizer and the workhorse of tests.
#[derive(Debug, Clone)]
pub struct ByteTokenizer {
    bos: Option<TokenId>,
    eos: Option<TokenId>,
    pad: Option<TokenId>,
}

impl Default for ByteTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteTokenizer {
    /// Byte tokenizer with PAD = 0, BOS = 1, EOS = 2
    pub fn new() -> Self {
        Self {
            bos: Some(1),
            eos: Some(2),
            pad: Some(0),
        }
    }

    /// Byte tokenizer with explicit special tokens
    pub fn with_special_tokens(
        bos: Option<TokenId>,
        eos: Option<TokenId>,
        pad: Option<TokenId>,
    ) -> Self {
        Self { bos, eos, pad }
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> crate::Result<Vec<TokenId>> {
        Ok(text.bytes().map(TokenId::from).collect())
    }

    fn decode(&self, tokens: &[TokenId]) -> crate::Result<String> {
        let bytes = tokens
            .iter()
            .map(|&token| {
                u8::try_from(token).map_err(|_| crate::EmbeeError::OutOfVocabularyToken {
                    token,
                    vocab_size: BYTE_VOCAB_SIZE,
                })
            })
            .collect::<crate::Result<Vec<u8>>>()?;

        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        BYTE_VOCAB_SIZE
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let tokenizer = ByteTokenizer::new();

        let tokens = tokenizer.encode("Hi").unwrap();
        assert_eq!(tokens, vec![72, 105]);
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "Hi");

        let tokens = tokenizer.encode("héllo").unwrap();
        assert_eq!(tokens.len(), 6);
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "héllo");
    }

    #[test]
    fn test_single_token_fragments_split_multibyte_chars() {
        let tokenizer = ByteTokenizer::new();
        let tokens = tokenizer.encode("é").unwrap();
        assert_eq!(tokens.len(), 2);

        let fragments: String = tokens
            .iter()
            .map(|&token| tokenizer.decode(&[token]).unwrap())
            .collect();
        assert_eq!(fragments, "\u{FFFD}\u{FFFD}");
        assert_eq!(tokenizer.decode(&tokens).unwrap(), "é");
    }

    #[test]
    fn test_decode_rejects_out_of_range() {
        let tokenizer = ByteTokenizer::new();
        assert!(matches!(
            tokenizer.decode(&[65, 256]),
            Err(crate::EmbeeError::OutOfVocabularyToken { token: 256, .. })
        ));
        assert!(tokenizer.decode(&[-1]).is_err());
    }

    #[test]
    fn test_special_tokens() {
        let tokenizer = ByteTokenizer::new();
        assert_eq!(tokenizer.vocab_size(), 256);
        assert_eq!(tokenizer.bos_token(), Some(1));
        assert_eq!(tokenizer.eos_token(), Some(2));
        assert_eq!(tokenizer.pad_token(), Some(0));

        let tokenizer = ByteTokenizer::with_special_tokens(None, None, None);
        assert_eq!(tokenizer.eos_token(), None);
    }
}
