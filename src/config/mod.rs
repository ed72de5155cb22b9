//! Configuration module for model settings and parameters.

mod model_config;

pub use model_config::{ActivationFunction, ModelArchitecture, ModelConfig, QuantizationType};
