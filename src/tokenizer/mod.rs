//! Text to token conversion.

mod byte;
mod hf;

use std::io::Read;
use std::path::Path;

pub use byte::ByteTokenizer;
pub use hf::HfTokenizer;

use crate::TokenId;

/// Converts text to token ids and back.
pub trait Tokenizer {
    /// Encode text into token ids
    fn encode(&self, text: &str) -> crate::Result<Vec<TokenId>>;

    /// Decode token ids into text.
    ///
    /// Streamed fragments are single-token decodes, so a tokenizer whose
    /// decoder strips leading spaces or splits multi-byte characters across
    /// tokens yields fragments that differ from decoding the whole sequence.
    fn decode(&self, tokens: &[TokenId]) -> crate::Result<String>;

    /// Number of distinct token ids
    fn vocab_size(&self) -> usize;

    fn bos_token(&self) -> Option<TokenId> {
        None
    }

    fn eos_token(&self) -> Option<TokenId> {
        None
    }

    fn pad_token(&self) -> Option<TokenId> {
        None
    }
}

/// On-disk tokenizer formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenizerFormat {
    /// Hugging Face tokenizer.json
    HuggingFace,
    /// SentencePiece protobuf model
    SentencePiece,
}

impl TokenizerFormat {
    /// Detect the format from the file contents, falling back to the extension
    pub fn detect(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();

        let mut head = [0u8; 64];
        let n = std::fs::File::open(path)?.read(&mut head)?;
        let head = &head[..n];
        if head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            return Ok(Self::HuggingFace);
        }
        // protobuf field 1, length-delimited
        if head.first() == Some(&0x0a) && head.get(1).is_some_and(|b| *b != b'{') {
            return Ok(Self::SentencePiece);
        }

        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Ok(Self::HuggingFace),
            Some("model") => Ok(Self::SentencePiece),
            _ => Err(crate::EmbeeError::UnsupportedFormat(format!(
                "unrecognized tokenizer file: {}",
                path.display()
            ))),
        }
    }
}

/// Tokenizer chosen at runtime.
pub enum AutoTokenizer {
    HuggingFace(HfTokenizer),
    Byte(ByteTokenizer),
}

impl AutoTokenizer {
    /// Load a tokenizer file, detecting its format
    pub fn from_path(path: impl AsRef<Path>) -> crate::Result<Self> {
        let path = path.as_ref();
        match TokenizerFormat::detect(path)? {
            TokenizerFormat::HuggingFace => {
                tracing::info!("Loading tokenizer from {}", path.display());
                Ok(Self::HuggingFace(HfTokenizer::from_file(path)?))
            }
            TokenizerFormat::SentencePiece => Err(crate::EmbeeError::UnsupportedFormat(format!(
                "SentencePiece tokenizers are not supported ({}); convert to tokenizer.json",
                path.display()
            ))),
        }
    }

    /// Find the tokenizer shipped beside a model, or fall back to bytes
    pub fn for_model(model_path: impl AsRef<Path>) -> crate::Result<Self> {
        let model_path = model_path.as_ref();
        let dir = if model_path.is_dir() {
            model_path
        } else {
            model_path.parent().unwrap_or_else(|| Path::new("."))
        };

        let candidate = dir.join("tokenizer.json");
        if candidate.is_file() {
            return Self::from_path(candidate);
        }

        tracing::warn!(
            "No tokenizer.json in {}, using byte-level tokenizer",
            dir.display()
        );
        Ok(Self::Byte(ByteTokenizer::new()))
    }

    fn inner(&self) -> &dyn Tokenizer {
        match self {
            Self::HuggingFace(tokenizer) => tokenizer,
            Self::Byte(tokenizer) => tokenizer,
        }
    }
}

impl Tokenizer for AutoTokenizer {
    fn encode(&self, text: &str) -> crate::Result<Vec<TokenId>> {
        self.inner().encode(text)
    }

    fn decode(&self, tokens: &[TokenId]) -> crate::Result<String> {
        self.inner().decode(tokens)
    }

    fn vocab_size(&self) -> usize {
        self.inner().vocab_size()
    }

    fn bos_token(&self) -> Option<TokenId> {
        self.inner().bos_token()
    }

    fn eos_token(&self) -> Option<TokenId> {
        self.inner().eos_token()
    }

    fn pad_token(&self) -> Option<TokenId> {
        self.inner().pad_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_by_content() {
        let dir = tempfile::tempdir().unwrap();

        let json = dir.path().join("vocab.bin");
        std::fs::write(&json, "  \n{\"version\": \"1.0\"}").unwrap();
        assert_eq!(TokenizerFormat::detect(&json).unwrap(), TokenizerFormat::HuggingFace);

        let spm = dir.path().join("weird_name");
        std::fs::write(&spm, [0x0a, 0x05, b'<', b'u', b'n', b'k', b'>']).unwrap();
        assert_eq!(TokenizerFormat::detect(&spm).unwrap(), TokenizerFormat::SentencePiece);
    }

    #[test]
    fn test_detect_falls_back_to_extension() {
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("tokenizer.model");
        std::fs::write(&path, [0xff, 0x00]).unwrap();
        assert_eq!(TokenizerFormat::detect(&path).unwrap(), TokenizerFormat::SentencePiece);

        let path = dir.path().join("tokenizer.txt");
        std::fs::write(&path, "hello").unwrap();
        assert!(matches!(
            TokenizerFormat::detect(&path),
            Err(crate::EmbeeError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_auto_tokenizer_for_model() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.safetensors");

        let tokenizer = AutoTokenizer::for_model(&weights).unwrap();
        assert!(matches!(tokenizer, AutoTokenizer::Byte(_)));
        assert_eq!(tokenizer.vocab_size(), 256);

        std::fs::write(dir.path().join("tokenizer.json"), hf::tests::WORD_LEVEL_JSON).unwrap();
        let tokenizer = AutoTokenizer::for_model(&weights).unwrap();
        assert!(matches!(tokenizer, AutoTokenizer::HuggingFace(_)));
        assert_eq!(tokenizer.encode("world hello").unwrap(), vec![4, 3]);
        assert_eq!(tokenizer.eos_token(), Some(2));
    }

    #[test]
    fn test_sentencepiece_is_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.model");
        std::fs::write(&path, [0x0a, 0x01, 0x00]).unwrap();
        assert!(matches!(
            AutoTokenizer::from_path(&path),
            Err(crate::EmbeeError::UnsupportedFormat(_))
        ));
    }
}
