//! Generation configuration.

use serde::{Deserialize, Serialize};

/// Configuration for one generation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Maximum number of tokens to generate
    pub max_length: usize,

    /// Temperature for sampling (0.0 = always pick the highest score)
    pub temperature: f32,

    /// Top-p (nucleus) sampling threshold, in (0, 1]
    pub top_p: f32,

    /// Repetition penalty (1.0 = no penalty)
    pub repetition_penalty: f32,

    /// Keep the KV cache allocation across calls
    pub use_cache: bool,

    /// Reseed the engine's random source for this call
    pub seed: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_length: 512,
            temperature: 0.8,
            top_p: 0.9,
            repetition_penalty: 1.1,
            use_cache: true,
            seed: None,
        }
    }
}

impl GenerationConfig {
    /// Create a greedy decoding configuration
    pub fn greedy() -> Self {
        Self {
            temperature: 0.0,
            top_p: 1.0,
            repetition_penalty: 1.0,
            ..Default::default()
        }
    }

    /// Create a creative sampling configuration
    pub fn creative() -> Self {
        Self {
            temperature: 1.0,
            top_p: 0.95,
            ..Default::default()
        }
    }

    /// Create a precise/factual configuration
    pub fn precise() -> Self {
        Self {
            temperature: 0.3,
            top_p: 0.85,
            ..Default::default()
        }
    }

    /// Reject configurations the sampler cannot honor
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_length == 0 {
            return Err(crate::EmbeeError::InvalidConfig(
                "max_length must be positive".to_string(),
            ));
        }

        if !self.temperature.is_finite() || self.temperature < 0.0 {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "temperature must be a finite value >= 0, got {}",
                self.temperature
            )));
        }

        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "top_p must be in (0, 1], got {}",
                self.top_p
            )));
        }

        if !self.repetition_penalty.is_finite() || self.repetition_penalty < 0.0 {
            return Err(crate::EmbeeError::InvalidConfig(format!(
                "repetition_penalty must be a finite value >= 0, got {}",
                self.repetition_penalty
            )));
        }

        Ok(())
    }

    /// Set max tokens to generate
    pub fn with_max_length(mut self, max_length: usize) -> Self {
        self.max_length = max_length;
        self
    }

    /// Set temperature
    pub fn with_temperature(mut self, temp: f32) -> Self {
        self.temperature = temp;
        self
    }

    /// Set top-p threshold
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    /// Set repetition penalty
    pub fn with_repetition_penalty(mut self, penalty: f32) -> Self {
        self.repetition_penalty = penalty;
        self
    }

    /// Enable or disable KV cache reuse
    pub fn with_cache(mut self, use_cache: bool) -> Self {
        self.use_cache = use_cache;
        self
    }

    /// Set random seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }
}
