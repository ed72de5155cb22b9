//! Key-value cache for efficient autoregressive generation.

use candle_core::{DType, Device, Tensor};

use crate::config::ModelConfig;

/// Preallocated cache of key and value projections.
///
/// Each layer owns one key and one value tensor of shape
/// `[capacity, n_kv_heads, head_dim]`. The backend writes rows at known
/// positions during a forward pass; the engine commits them with
/// [`KvCache::advance`] once the pass succeeded. `reset` only rewinds the
/// occupied length, so the allocation is reused across generation calls.
pub struct KvCache {
    /// Cached key tensors per layer
    keys: Vec<Tensor>,
    /// Cached value tensors per layer
    values: Vec<Tensor>,
    /// Maximum number of positions
    capacity: usize,
    /// Current sequence length (how many positions are committed)
    current_len: usize,
    /// Number of KV heads
    num_kv_heads: usize,
    /// Head dimension
    head_dim: usize,
    /// Contents undefined after a failed forward pass
    needs_reset: bool,
    device: Device,
    dtype: DType,
}

impl KvCache {
    /// Allocate a cache for the model's full sequence length
    pub fn allocate(config: &ModelConfig, device: &Device, dtype: DType) -> crate::Result<Self> {
        Self::with_capacity(config, config.max_seq_len, device, dtype)
    }

    /// Allocate a cache holding at most `capacity` positions
    pub fn with_capacity(
        config: &ModelConfig,
        capacity: usize,
        device: &Device,
        dtype: DType,
    ) -> crate::Result<Self> {
        let num_kv_heads = config.num_kv_heads();
        let head_dim = config.head_dim();
        let shape = (capacity, num_kv_heads, head_dim);

        let mut keys = Vec::with_capacity(config.n_layers);
        let mut values = Vec::with_capacity(config.n_layers);
        for _ in 0..config.n_layers {
            keys.push(Tensor::zeros(shape, dtype, device)?);
            values.push(Tensor::zeros(shape, dtype, device)?);
        }

        tracing::debug!(
            layers = config.n_layers,
            capacity,
            num_kv_heads,
            head_dim,
            "allocated kv cache"
        );

        Ok(Self {
            keys,
            values,
            capacity,
            current_len: 0,
            num_kv_heads,
            head_dim,
            needs_reset: false,
            device: device.clone(),
            dtype,
        })
    }

    /// Store `[n, num_kv_heads, head_dim]` key and value rows for a layer at
    /// positions `position..position + n`
    pub fn write(
        &mut self,
        layer_idx: usize,
        position: usize,
        new_key: &Tensor,
        new_value: &Tensor,
    ) -> crate::Result<()> {
        if layer_idx >= self.keys.len() {
            return Err(crate::EmbeeError::BackendFailure(format!(
                "layer {} out of range (cache has {} layers)",
                layer_idx,
                self.keys.len()
            )));
        }

        let rows = new_key.dims().first().copied().unwrap_or(0);
        let expected = [rows, self.num_kv_heads, self.head_dim];
        if new_key.dims() != expected.as_slice() || new_value.dims() != expected.as_slice() {
            return Err(crate::EmbeeError::BackendFailure(format!(
                "kv rows must have shape {:?}, got keys {:?} values {:?}",
                expected,
                new_key.dims(),
                new_value.dims()
            )));
        }

        self.check_capacity(position + rows)?;

        let new_key = new_key.to_dtype(self.dtype)?.contiguous()?;
        let new_value = new_value.to_dtype(self.dtype)?.contiguous()?;
        self.keys[layer_idx].slice_set(&new_key, 0, position)?;
        self.values[layer_idx].slice_set(&new_value, 0, position)?;

        Ok(())
    }

    /// Get the first `len` cached keys and values for a layer
    pub fn layer(&self, layer_idx: usize, len: usize) -> crate::Result<(Tensor, Tensor)> {
        let (Some(keys), Some(values)) = (self.keys.get(layer_idx), self.values.get(layer_idx))
        else {
            return Err(crate::EmbeeError::BackendFailure(format!(
                "layer {layer_idx} out of range"
            )));
        };
        self.check_capacity(len)?;

        Ok((keys.narrow(0, 0, len)?, values.narrow(0, 0, len)?))
    }

    /// Commit `n` freshly written positions
    pub fn advance(&mut self, n: usize) -> crate::Result<()> {
        self.check_capacity(self.current_len + n)?;
        self.current_len += n;
        Ok(())
    }

    /// Fail unless `n` more positions fit
    pub fn ensure_room(&self, n: usize) -> crate::Result<()> {
        self.check_capacity(self.current_len + n)
    }

    fn check_capacity(&self, requested: usize) -> crate::Result<()> {
        if requested > self.capacity {
            return Err(crate::EmbeeError::CacheCapacityExceeded {
                requested,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Get current sequence length
    pub fn current_length(&self) -> usize {
        self.current_len
    }

    /// Maximum number of positions
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Positions left before the cache is full
    pub fn remaining(&self) -> usize {
        self.capacity - self.current_len
    }

    /// Number of layers
    pub fn num_layers(&self) -> usize {
        self.keys.len()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.current_len == 0
    }

    /// Check if cache is full
    pub fn is_full(&self) -> bool {
        self.current_len >= self.capacity
    }

    /// Rewind to an empty cache, keeping the allocation
    pub fn reset(&mut self) {
        self.current_len = 0;
        self.needs_reset = false;
    }

    /// Mark the contents as undefined until the next reset
    pub fn invalidate(&mut self) {
        self.needs_reset = true;
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Get memory usage in bytes
    pub fn memory_usage(&self) -> usize {
        self.keys
            .iter()
            .chain(self.values.iter())
            .map(|tensor| tensor.elem_count() * tensor.dtype().size_in_bytes())
            .sum()
    }
}
