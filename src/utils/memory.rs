//! Memory footprint estimates.

use candle_core::DType;

use crate::config::ModelConfig;

/// Bytes a full-length KV cache occupies: keys and values for every layer
pub fn kv_cache_bytes(config: &ModelConfig, dtype: DType) -> u64 {
    2 * config.n_layers as u64
        * config.max_seq_len as u64
        * config.kv_dim() as u64
        * dtype.size_in_bytes() as u64
}

/// Rough parameter memory of a llama-style decoder, at the declared
/// quantization width when there is one
pub fn weight_bytes(config: &ModelConfig, dtype: DType) -> u64 {
    let n_embd = config.n_embd as u64;
    let kv_dim = config.kv_dim() as u64;
    let ffn = config.ffn_dim() as u64;
    let vocab = config.vocab_size as u64;

    let attention = 2 * n_embd * n_embd + 2 * n_embd * kv_dim;
    let mlp = 3 * n_embd * ffn;
    let per_layer = attention + mlp + 2 * n_embd;
    let head = if config.tie_word_embeddings { 0 } else { vocab * n_embd };

    let params = vocab * n_embd + config.n_layers as u64 * per_layer + n_embd + head;
    match config.quant_type.bits_per_weight() {
        Some(bits) => (params * bits as u64).div_ceil(8),
        None => params * dtype.size_in_bytes() as u64,
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}
