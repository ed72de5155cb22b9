//! Llama-style decoder on candle that keeps its attention state in the
//! engine's [`KvCache`].

use std::collections::HashMap;
use std::path::PathBuf;

use candle_core::{DType, Device, Module, Tensor, D};
use candle_nn::Embedding;

use super::base::ForwardPass;
use super::loader::WeightLoader;
use crate::config::{ActivationFunction, ModelConfig};
use crate::generation::KvCache;
use crate::TokenId;

/// Weights of one decoder block
struct Block {
    input_norm: Tensor,
    post_attention_norm: Tensor,
    q_proj: Tensor,
    k_proj: Tensor,
    v_proj: Tensor,
    o_proj: Tensor,
    gate_proj: Tensor,
    up_proj: Tensor,
    down_proj: Tensor,
}

/// Decoder-only transformer: embedding, blocks of grouped-query attention
/// and gated MLP, final RMS norm, LM head.
pub struct TransformerModel {
    config: ModelConfig,
    device: Device,
    dtype: DType,
    embed_tokens: Embedding,
    blocks: Vec<Block>,
    norm: Tensor,
    lm_head: Tensor,
    /// RoPE cos/sin tables, `[max_seq_len, head_dim / 2]`
    rope_cache: Option<(Tensor, Tensor)>,
}

impl TransformerModel {
    /// Build from named tensors using Hugging Face llama parameter names
    pub fn new(
        config: ModelConfig,
        mut weights: HashMap<String, Tensor>,
        device: Device,
        dtype: DType,
    ) -> crate::Result<Self> {
        config.validate()?;

        let n_embd = config.n_embd;
        let kv_dim = config.kv_dim();
        let ffn = config.ffn_dim();
        let vocab = config.vocab_size;

        let mut take = |name: &str, shape: &[usize]| -> crate::Result<Tensor> {
            let tensor = weights.remove(name).ok_or_else(|| {
                crate::EmbeeError::ModelLoad(format!("Missing weight {name}"))
            })?;
            if tensor.dims() != shape {
                return Err(crate::EmbeeError::ModelLoad(format!(
                    "{name} has shape {:?}, expected {:?}",
                    tensor.dims(),
                    shape
                )));
            }
            Ok(tensor.to_dtype(dtype)?.to_device(&device)?)
        };

        let embed_weight = take("model.embed_tokens.weight", &[vocab, n_embd])?;

        let mut blocks = Vec::with_capacity(config.n_layers);
        for i in 0..config.n_layers {
            let p = format!("model.layers.{i}");
            blocks.push(Block {
                input_norm: take(&format!("{p}.input_layernorm.weight"), &[n_embd])?,
                post_attention_norm: take(
                    &format!("{p}.post_attention_layernorm.weight"),
                    &[n_embd],
                )?,
                q_proj: take(&format!("{p}.self_attn.q_proj.weight"), &[n_embd, n_embd])?,
                k_proj: take(&format!("{p}.self_attn.k_proj.weight"), &[kv_dim, n_embd])?,
                v_proj: take(&format!("{p}.self_attn.v_proj.weight"), &[kv_dim, n_embd])?,
                o_proj: take(&format!("{p}.self_attn.o_proj.weight"), &[n_embd, n_embd])?,
                gate_proj: take(&format!("{p}.mlp.gate_proj.weight"), &[ffn, n_embd])?,
                up_proj: take(&format!("{p}.mlp.up_proj.weight"), &[ffn, n_embd])?,
                down_proj: take(&format!("{p}.mlp.down_proj.weight"), &[n_embd, ffn])?,
            });
        }

        let norm = take("model.norm.weight", &[n_embd])?;
        let lm_head = match take("lm_head.weight", &[vocab, n_embd]) {
            Ok(weight) => weight,
            Err(_) if config.tie_word_embeddings => embed_weight.clone(),
            Err(e) => return Err(e),
        };

        let mut model = Self {
            embed_tokens: Embedding::new(embed_weight, n_embd),
            config,
            device,
            dtype,
            blocks,
            norm,
            lm_head,
            rope_cache: None,
        };
        if model.config.is_rope {
            model.init_rope_cache()?;
        }

        Ok(model)
    }

    /// Load memory-mapped safetensors shards
    pub fn from_safetensors(
        config: ModelConfig,
        files: &[PathBuf],
        device: Device,
        dtype: DType,
    ) -> crate::Result<Self> {
        tracing::info!("Loading transformer weights");
        let loader = WeightLoader::new(device.clone(), dtype);
        let weights = loader.load_all(files)?;
        Self::new(config, weights, device, dtype)
    }

    /// Initialize rotary position embedding cache
    fn init_rope_cache(&mut self) -> crate::Result<()> {
        let head_dim = self.config.head_dim();
        let max_seq_len = self.config.max_seq_len;
        let theta = self.config.rope_freq_base;
        let scale = self.config.rope_scale;

        // Compute inverse frequencies
        let inv_freq: Vec<f32> = (0..head_dim)
            .step_by(2)
            .map(|i| (1.0 / theta.powf(i as f64 / head_dim as f64)) as f32)
            .collect();
        let inv_freq = Tensor::from_vec(inv_freq, (1, head_dim / 2), &self.device)?;

        // Linear position scaling for extended context
        let positions: Vec<f32> = (0..max_seq_len).map(|i| (i as f64 / scale) as f32).collect();
        let positions = Tensor::from_vec(positions, (max_seq_len, 1), &self.device)?;

        // Outer product: [seq_len, 1] x [1, head_dim/2] -> [seq_len, head_dim/2]
        let freqs = positions.matmul(&inv_freq)?;

        let cos = freqs.cos()?.to_dtype(self.dtype)?;
        let sin = freqs.sin()?.to_dtype(self.dtype)?;
        self.rope_cache = Some((cos, sin));

        Ok(())
    }

    /// Apply rotary embeddings to `[seq, heads, head_dim]` rows starting at `start`
    fn apply_rope(&self, x: &Tensor, start: usize) -> crate::Result<Tensor> {
        let Some((cos, sin)) = self.rope_cache.as_ref() else {
            return Ok(x.clone());
        };

        let seq_len = x.dim(0)?;
        let half_dim = x.dim(D::Minus1)? / 2;
        // [seq, 1, head_dim/2] broadcasts over heads
        let cos = cos.narrow(0, start, seq_len)?.unsqueeze(1)?;
        let sin = sin.narrow(0, start, seq_len)?.unsqueeze(1)?;

        let x1 = x.narrow(D::Minus1, 0, half_dim)?;
        let x2 = x.narrow(D::Minus1, half_dim, half_dim)?;

        // Rotate: [x1, x2] -> [x1 * cos - x2 * sin, x2 * cos + x1 * sin]
        let rotated_x1 = (x1.broadcast_mul(&cos)? - x2.broadcast_mul(&sin)?)?;
        let rotated_x2 = (x2.broadcast_mul(&cos)? + x1.broadcast_mul(&sin)?)?;

        Ok(Tensor::cat(&[&rotated_x1, &rotated_x2], D::Minus1)?)
    }

    /// RMS normalization
    fn rms_norm(&self, x: &Tensor, weight: &Tensor) -> crate::Result<Tensor> {
        let variance = x.sqr()?.mean_keepdim(D::Minus1)?;
        let rms = (variance + self.config.rms_norm_eps)?.sqrt()?;
        Ok(x.broadcast_div(&rms)?.broadcast_mul(weight)?)
    }

    fn attention(
        &self,
        layer_idx: usize,
        block: &Block,
        hidden: &Tensor,
        start: usize,
        cache: &mut KvCache,
    ) -> crate::Result<Tensor> {
        let seq_len = hidden.dim(0)?;
        let n_heads = self.config.n_heads;
        let n_kv_heads = self.config.num_kv_heads();
        let head_dim = self.config.head_dim();
        let total = start + seq_len;

        let q = hidden
            .matmul(&block.q_proj.t()?)?
            .reshape((seq_len, n_heads, head_dim))?;
        let k = hidden
            .matmul(&block.k_proj.t()?)?
            .reshape((seq_len, n_kv_heads, head_dim))?;
        let v = hidden
            .matmul(&block.v_proj.t()?)?
            .reshape((seq_len, n_kv_heads, head_dim))?;

        let q = self.apply_rope(&q, start)?;
        let k = self.apply_rope(&k, start)?;

        cache.write(layer_idx, start, &k, &v)?;
        let (k, v) = cache.layer(layer_idx, total)?;

        // [heads, seq, head_dim]
        let q = q.transpose(0, 1)?.contiguous()?;
        let k = repeat_kv(&k.to_dtype(self.dtype)?, self.config.kv_group_size())?;
        let v = repeat_kv(&v.to_dtype(self.dtype)?, self.config.kv_group_size())?;

        let scale = (head_dim as f64).sqrt();
        let scores = (q.matmul(&k.t()?.contiguous()?)? / scale)?;
        let scores = if seq_len > 1 {
            let mask = causal_mask(seq_len, start, &self.device)?.to_dtype(self.dtype)?;
            scores.broadcast_add(&mask)?
        } else {
            scores
        };

        let weights = candle_nn::ops::softmax(&scores, D::Minus1)?;
        let output = weights
            .matmul(&v)?
            .transpose(0, 1)?
            .reshape((seq_len, n_heads * head_dim))?;

        Ok(output.matmul(&block.o_proj.t()?)?)
    }

    /// Gated MLP: down(act(gate(x)) * up(x))
    fn mlp(&self, block: &Block, hidden: &Tensor) -> crate::Result<Tensor> {
        let gate = hidden.matmul(&block.gate_proj.t()?)?;
        let up = hidden.matmul(&block.up_proj.t()?)?;

        let gate = match self.config.activation {
            ActivationFunction::Silu | ActivationFunction::Swiglu => candle_nn::ops::silu(&gate)?,
            ActivationFunction::Gelu => gate.gelu()?,
            ActivationFunction::Relu => gate.relu()?,
        };

        Ok((gate * up)?.matmul(&block.down_proj.t()?)?)
    }

    /// Run `tokens` at positions `start..`, returning last-position scores
    fn forward(
        &self,
        tokens: &[TokenId],
        start: usize,
        cache: &mut KvCache,
    ) -> crate::Result<Vec<f32>> {
        let vocab_size = self.config.vocab_size;
        let ids = tokens
            .iter()
            .map(|&token| {
                u32::try_from(token)
                    .ok()
                    .filter(|&id| (id as usize) < vocab_size)
                    .ok_or(crate::EmbeeError::OutOfVocabularyToken { token, vocab_size })
            })
            .collect::<crate::Result<Vec<u32>>>()?;
        if ids.is_empty() {
            return Err(crate::EmbeeError::BackendFailure(
                "forward pass over zero tokens".to_string(),
            ));
        }

        let seq_len = ids.len();
        let ids = Tensor::from_vec(ids, seq_len, &self.device)?;
        let mut hidden = self.embed_tokens.forward(&ids)?;

        for (layer_idx, block) in self.blocks.iter().enumerate() {
            let normed = self.rms_norm(&hidden, &block.input_norm)?;
            let attn = self.attention(layer_idx, block, &normed, start, cache)?;
            hidden = (hidden + attn)?;

            let normed = self.rms_norm(&hidden, &block.post_attention_norm)?;
            let mlp = self.mlp(block, &normed)?;
            hidden = (hidden + mlp)?;
        }

        let hidden = self.rms_norm(&hidden, &self.norm)?;
        let last = hidden.narrow(0, seq_len - 1, 1)?;
        let logits = last.matmul(&self.lm_head.t()?)?;

        Ok(logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?)
    }
}

impl ForwardPass for TransformerModel {
    fn config(&self) -> &ModelConfig {
        &self.config
    }

    fn prime(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> crate::Result<Vec<f32>> {
        self.forward(tokens, cache.current_length(), cache)
    }

    fn step(
        &mut self,
        token: TokenId,
        position: usize,
        cache: &mut KvCache,
    ) -> crate::Result<Vec<f32>> {
        self.forward(&[token], position, cache)
    }

    fn device(&self) -> Device {
        self.device.clone()
    }

    fn dtype(&self) -> DType {
        self.dtype
    }
}

/// Expand `[kv_heads, seq, head_dim]` so each query head gets its KV head
fn repeat_kv(x: &Tensor, n_rep: usize) -> crate::Result<Tensor> {
    // cache rows are [seq, kv_heads, head_dim]
    let x = x.transpose(0, 1)?;
    if n_rep == 1 {
        return Ok(x.contiguous()?);
    }

    let (kv_heads, seq_len, head_dim) = x.dims3()?;
    Ok(x.unsqueeze(1)?
        .broadcast_as((kv_heads, n_rep, seq_len, head_dim))?
        .contiguous()?
        .reshape((kv_heads * n_rep, seq_len, head_dim))?)
}

/// Causal mask for `seq_len` queries at positions `start..`, over
/// `start + seq_len` keys
fn causal_mask(seq_len: usize, start: usize, device: &Device) -> crate::Result<Tensor> {
    let total = start + seq_len;
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| {
            (0..total).map(move |j| if j > start + i { f32::NEG_INFINITY } else { 0.0 })
        })
        .collect();

    Ok(Tensor::from_vec(mask, (seq_len, total), device)?)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn tiny_config(vocab_size: usize) -> ModelConfig {
        let mut config = ModelConfig::new(vocab_size, 16, 2, 4, 2, 16);
        config.intermediate_size = Some(24);
        config
    }

    /// Deterministic weights with Hugging Face llama names
    pub(crate) fn synthetic_weights(config: &ModelConfig) -> HashMap<String, Tensor> {
        let n_embd = config.n_embd;
        let kv_dim = config.kv_dim();
        let ffn = config.ffn_dim();
        let mut seed = 0usize;
        let mut tensor = |shape: &[usize]| {
            seed += 1;
            let len: usize = shape.iter().product();
            let data: Vec<f32> = (0..len)
                .map(|i| ((i * 31 + seed * 17) as f32 * 0.37).sin() * 0.2)
                .collect();
            Tensor::from_vec(data, shape, &Device::Cpu).unwrap()
        };
        let ones = |n: usize| Tensor::ones(n, DType::F32, &Device::Cpu).unwrap();

        let mut weights = HashMap::new();
        weights.insert(
            "model.embed_tokens.weight".to_string(),
            tensor(&[config.vocab_size, n_embd]),
        );
        for i in 0..config.n_layers {
            let p = format!("model.layers.{i}");
            weights.insert(format!("{p}.input_layernorm.weight"), ones(n_embd));
            weights.insert(format!("{p}.post_attention_layernorm.weight"), ones(n_embd));
            weights.insert(format!("{p}.self_attn.q_proj.weight"), tensor(&[n_embd, n_embd]));
            weights.insert(format!("{p}.self_attn.k_proj.weight"), tensor(&[kv_dim, n_embd]));
            weights.insert(format!("{p}.self_attn.v_proj.weight"), tensor(&[kv_dim, n_embd]));
            weights.insert(format!("{p}.self_attn.o_proj.weight"), tensor(&[n_embd, n_embd]));
            weights.insert(format!("{p}.mlp.gate_proj.weight"), tensor(&[ffn, n_embd]));
            weights.insert(format!("{p}.mlp.up_proj.weight"), tensor(&[ffn, n_embd]));
            weights.insert(format!("{p}.mlp.down_proj.weight"), tensor(&[n_embd, ffn]));
        }
        weights.insert("model.norm.weight".to_string(), ones(n_embd));
        weights.insert(
            "lm_head.weight".to_string(),
            tensor(&[config.vocab_size, n_embd]),
        );
        weights
    }

    fn tiny_model() -> TransformerModel {
        let config = tiny_config(32);
        let weights = synthetic_weights(&config);
        TransformerModel::new(config, weights, Device::Cpu, DType::F32).unwrap()
    }

    fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
        a.iter().zip(b).map(|(x, y)| (x - y).abs()).fold(0.0, f32::max)
    }

    #[test]
    fn test_incremental_step_matches_full_prime() {
        let mut model = tiny_model();
        let tokens = [3, 7, 1, 12, 5];

        let mut full_cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        let full = model.prime(&tokens, &mut full_cache).unwrap();
        assert_eq!(full.len(), 32);

        let mut cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        model.prime(&tokens[..4], &mut cache).unwrap();
        cache.advance(4).unwrap();
        let stepped = model.step(tokens[4], 4, &mut cache).unwrap();

        assert!(max_abs_diff(&full, &stepped) < 1e-4);
    }

    #[test]
    fn test_without_rope_positions_still_cached() {
        let mut config = tiny_config(32);
        config.is_rope = false;
        let weights = synthetic_weights(&config);
        let mut model = TransformerModel::new(config, weights, Device::Cpu, DType::F32).unwrap();

        let mut full_cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        let full = model.prime(&[9, 2, 4], &mut full_cache).unwrap();

        let mut cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        model.prime(&[9, 2], &mut cache).unwrap();
        cache.advance(2).unwrap();
        let stepped = model.step(4, 2, &mut cache).unwrap();

        assert!(max_abs_diff(&full, &stepped) < 1e-4);
    }

    #[test]
    fn test_missing_or_misshapen_weight() {
        let config = tiny_config(32);

        let mut weights = synthetic_weights(&config);
        weights.remove("model.layers.1.mlp.up_proj.weight");
        assert!(matches!(
            TransformerModel::new(config.clone(), weights, Device::Cpu, DType::F32),
            Err(crate::EmbeeError::ModelLoad(_))
        ));

        let mut weights = synthetic_weights(&config);
        weights.insert(
            "model.norm.weight".to_string(),
            Tensor::ones(3, DType::F32, &Device::Cpu).unwrap(),
        );
        assert!(matches!(
            TransformerModel::new(config, weights, Device::Cpu, DType::F32),
            Err(crate::EmbeeError::ModelLoad(_))
        ));
    }

    #[test]
    fn test_tied_embeddings_use_embedding_as_head() {
        let mut config = tiny_config(32);
        config.tie_word_embeddings = true;
        let mut weights = synthetic_weights(&config);
        weights.remove("lm_head.weight");

        let mut model = TransformerModel::new(config, weights, Device::Cpu, DType::F32).unwrap();
        let mut cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        assert_eq!(model.prime(&[1, 2], &mut cache).unwrap().len(), 32);
    }

    #[test]
    fn test_rejects_out_of_vocabulary_token() {
        let mut model = tiny_model();
        let mut cache = KvCache::allocate(model.config(), &Device::Cpu, DType::F32).unwrap();
        assert!(matches!(
            model.prime(&[1, 32], &mut cache),
            Err(crate::EmbeeError::OutOfVocabularyToken { token: 32, .. })
        ));
    }

    #[test]
    fn test_engine_drives_transformer() {
        use crate::generation::{Engine, GenerationConfig};
        use crate::tokenizer::ByteTokenizer;

        let build = || {
            let config = tiny_config(256);
            let weights = synthetic_weights(&config);
            let model = TransformerModel::new(config, weights, Device::Cpu, DType::F32).unwrap();
            Engine::with_seed(model, ByteTokenizer::new(), 5).unwrap()
        };

        let config = GenerationConfig::default().with_max_length(6).with_seed(11);
        let (text_a, summary_a) = build().generate_with_summary("ab", &config).unwrap();
        let (text_b, summary_b) = build().generate_with_summary("ab", &config).unwrap();

        assert_eq!(summary_a, summary_b);
        assert_eq!(text_a, text_b);
        assert!(text_a.starts_with("ab"));
        assert!(summary_a.num_tokens() <= 6);

        // get_logits primes a scratch cache, never the engine's own
        let mut engine = build();
        let logits = engine.get_logits("ab").unwrap();
        assert_eq!(logits.len(), 256);
        assert!(engine.cache().is_none());
    }
}
