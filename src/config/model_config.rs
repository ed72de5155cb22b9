//! Model configuration structures for transformer architectures.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Weight quantization scheme declared by a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuantizationType {
    /// No quantization (full precision)
    #[default]
    None,
    Int8,
    Int4,
    Int5,
    Int4Block,
    Int5Block,
    Adaptive,
}

impl QuantizationType {
    /// Bits per weight, ignoring per-block scale overhead
    pub fn bits_per_weight(&self) -> Option<u32> {
        match self {
            QuantizationType::None => None,
            QuantizationType::Int8 => Some(8),
            QuantizationType::Int4 | QuantizationType::Int4Block => Some(4),
            QuantizationType::Int5 | QuantizationType::Int5Block => Some(5),
            QuantizationType::Adaptive => None,
        }
    }
}

/// MLP activation function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationFunction {
    #[serde(alias = "gelu_new", alias = "gelu_pytorch_tanh")]
    Gelu,
    #[default]
    Silu,
    Relu,
    Swiglu,
}

/// Supported model architectures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelArchitecture {
    Llama,
    Mistral,
    Gemma,
    Phi,
    Falcon,
    Gpt2,
    Mpt,
    Unknown(String),
}

impl ModelArchitecture {
    /// Detect architecture from config.json architectures field
    pub fn from_architectures(architectures: &[String]) -> Self {
        let Some(arch) = architectures.first() else {
            return ModelArchitecture::Unknown("empty".to_string());
        };

        if arch.contains("Mistral") || arch.contains("Mixtral") {
            ModelArchitecture::Mistral
        } else if arch.contains("Gemma") {
            ModelArchitecture::Gemma
        } else if arch.contains("Phi") {
            ModelArchitecture::Phi
        } else if arch.contains("Falcon") {
            ModelArchitecture::Falcon
        } else if arch.contains("GPT2") {
            ModelArchitecture::Gpt2
        } else if arch.contains("Mpt") || arch.contains("MPT") {
            ModelArchitecture::Mpt
        } else if arch.contains("Llama") {
            ModelArchitecture::Llama
        } else {
            ModelArchitecture::Unknown(arch.clone())
        }
    }
}

/// Resolved model configuration, read by the engine at construction.
///
/// Accepts both the short field names (`n_vocab`, `n_embd`, ...) and the
/// Hugging Face `config.json` names (`vocab_size`, `hidden_size`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Model architecture type(s)
    #[serde(default)]
    pub architectures: Vec<String>,

    /// Vocabulary size
    #[serde(alias = "n_vocab")]
    pub vocab_size: usize,

    /// Embedding dimension
    #[serde(alias = "hidden_size")]
    pub n_embd: usize,

    /// Number of transformer layers
    #[serde(alias = "num_hidden_layers")]
    pub n_layers: usize,

    /// Number of attention heads
    #[serde(alias = "num_attention_heads")]
    pub n_heads: usize,

    /// Number of key-value heads (for GQA/MQA)
    #[serde(default, alias = "num_key_value_heads")]
    pub n_kv_heads: Option<usize>,

    /// Maximum sequence length
    #[serde(default = "default_max_seq_len", alias = "max_position_embeddings")]
    pub max_seq_len: usize,

    /// Positions use rotary embeddings
    #[serde(default = "default_is_rope")]
    pub is_rope: bool,

    /// Intermediate size in MLP layers
    #[serde(default)]
    pub intermediate_size: Option<usize>,

    /// Base frequency for RoPE
    #[serde(default = "default_rope_freq_base", alias = "rope_theta")]
    pub rope_freq_base: f64,

    /// Position scaling factor for RoPE (extended context)
    #[serde(default = "default_rope_scale")]
    pub rope_scale: f64,

    /// RMS norm epsilon
    #[serde(default = "default_rms_norm_eps")]
    pub rms_norm_eps: f64,

    #[serde(default, alias = "hidden_act")]
    pub activation: ActivationFunction,

    #[serde(default)]
    pub quant_type: QuantizationType,

    /// Reuse the embedding matrix as LM head
    #[serde(default)]
    pub tie_word_embeddings: bool,

    /// Torch dtype hint
    #[serde(default)]
    pub torch_dtype: Option<String>,

    #[serde(default)]
    pub model_name: Option<String>,

    #[serde(default)]
    pub model_family: Option<String>,

    #[serde(default)]
    pub model_creator: Option<String>,
}

fn default_max_seq_len() -> usize {
    2048
}

fn default_is_rope() -> bool {
    true
}

fn default_rope_freq_base() -> f64 {
    10000.0
}

fn default_rope_scale() -> f64 {
    1.0
}

fn default_rms_norm_eps() -> f64 {
    1e-5
}

impl ModelConfig {
    /// Create a configuration from the core dimensions, all other fields defaulted
    pub fn new(
        vocab_size: usize,
        n_embd: usize,
        n_layers: usize,
        n_heads: usize,
        n_kv_heads: usize,
        max_seq_len: usize,
    ) -> Self {
        Self {
            architectures: Vec::new(),
            vocab_size,
            n_embd,
            n_layers,
            n_heads,
            n_kv_heads: Some(n_kv_heads),
            max_seq_len,
            is_rope: default_is_rope(),
            intermediate_size: None,
            rope_freq_base: default_rope_freq_base(),
            rope_scale: default_rope_scale(),
            rms_norm_eps: default_rms_norm_eps(),
            activation: ActivationFunction::default(),
            quant_type: QuantizationType::default(),
            tie_word_embeddings: false,
            torch_dtype: None,
            model_name: None,
            model_family: None,
            model_creator: None,
        }
    }

    /// Load configuration from a config.json file
    pub fn from_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ModelConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the structural invariants the engine and KV cache rely on
    pub fn validate(&self) -> crate::Result<()> {
        let counts = [
            ("vocab_size", self.vocab_size),
            ("n_embd", self.n_embd),
            ("n_layers", self.n_layers),
            ("n_heads", self.n_heads),
            ("n_kv_heads", self.num_kv_heads()),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = counts.iter().find(|(_, value)| *value == 0) {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "{name} must be positive"
            )));
        }

        if self.n_heads % self.num_kv_heads() != 0 {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "n_kv_heads ({}) must divide n_heads ({})",
                self.num_kv_heads(),
                self.n_heads
            )));
        }

        if self.n_embd % self.n_heads != 0 {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "n_embd ({}) must be a multiple of n_heads ({})",
                self.n_embd, self.n_heads
            )));
        }

        if self.vocab_size > i32::MAX as usize {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "vocab_size ({}) does not fit a token id",
                self.vocab_size
            )));
        }

        Ok(())
    }

    /// Get the detected model architecture
    pub fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::from_architectures(&self.architectures)
    }

    /// Get number of KV heads (defaults to n_heads for MHA)
    pub fn num_kv_heads(&self) -> usize {
        self.n_kv_heads.unwrap_or(self.n_heads)
    }

    /// Get head dimension
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_heads
    }

    /// Width of one cached key (or value) row: kv heads * head dim
    pub fn kv_dim(&self) -> usize {
        self.num_kv_heads() * self.head_dim()
    }

    /// Query heads sharing each KV head
    pub fn kv_group_size(&self) -> usize {
        self.n_heads / self.num_kv_heads()
    }

    /// Check if using grouped query attention
    pub fn is_gqa(&self) -> bool {
        self.num_kv_heads() != self.n_heads
    }

    /// MLP hidden width
    pub fn ffn_dim(&self) -> usize {
        self.intermediate_size.unwrap_or(4 * self.n_embd)
    }
}
