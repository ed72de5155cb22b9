//! Text generation: the decode engine, its KV cache and token sampling.

mod config;
mod engine;
mod kv_cache;
mod sampler;

pub use config::GenerationConfig;
pub use engine::{DecodeState, Engine, FinishReason, GenerationSummary};
pub use kv_cache::KvCache;
pub use sampler::{argmax, softmax, Sampler};
