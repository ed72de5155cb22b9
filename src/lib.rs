//! # rs-embee
//!
//! Local inference runtime for autoregressive transformer language models.
//!
//! ## Core Concept
//!
//! Given a forward-pass provider, a tokenizer and a prompt, the engine:
//! - **Primes** the model once over the whole prompt, filling the KV cache
//! - **Decodes** one token at a time, reusing cached keys/values
//! - **Samples** each token with temperature, repetition penalty and top-p
//! - **Streams** every token to a callback that may stop generation early
//!
//! ## Example
//!
//! ```ignore
//! use rs_embee::{AutoModel, AutoTokenizer, Engine, GenerationConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let model = AutoModel::from_path("models/tiny/model.safetensors", None, None)?;
//!     let tokenizer = AutoTokenizer::from_path("models/tiny/tokenizer.json")?;
//!     let mut engine = Engine::new(model, tokenizer)?;
//!
//!     let config = GenerationConfig::default().with_seed(42);
//!     engine.generate_streaming("Once upon a time", &config, |_, text| {
//!         print!("{text}");
//!         true
//!     })?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod generation;
pub mod model;
pub mod tokenizer;
pub mod utils;

// Re-exports for convenience
pub use config::{ModelArchitecture, ModelConfig};
pub use generation::{
    DecodeState, Engine, FinishReason, GenerationConfig, GenerationSummary, KvCache, Sampler,
};
pub use model::{AutoModel, ForwardPass, ModelFormat, TransformerModel};
pub use tokenizer::{AutoTokenizer, ByteTokenizer, HfTokenizer, Tokenizer, TokenizerFormat};
pub use utils::{DType, Device};

/// Token identifier. Valid ids lie in `[0, vocab_size)`.
pub type TokenId = i32;

/// Error types for the library
#[derive(thiserror::Error, Debug)]
pub enum EmbeeError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Tokenization failed: {0}")]
    TokenizationFailure(String),

    #[error("KV cache capacity exceeded: {requested} positions requested, capacity {capacity}")]
    CacheCapacityExceeded { requested: usize, capacity: usize },

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Token {token} is outside the vocabulary (size {vocab_size})")]
    OutOfVocabularyToken { token: TokenId, vocab_size: usize },

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Model loading failed: {0}")]
    ModelLoad(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    CandleError(#[from] candle_core::Error),

    #[error("JSON parse error: {0}")]
    JsonError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EmbeeError>;
