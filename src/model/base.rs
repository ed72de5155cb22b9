//! Forward-pass contract between the engine and a model backend.

use candle_core::{DType, Device};

use crate::config::ModelConfig;
use crate::generation::KvCache;
use crate::TokenId;

/// A model that turns a token context into next-token scores.
///
/// The engine owns the [`KvCache`] and lends it to every call. An
/// implementation writes its key/value rows for positions
/// `cache.current_length()..` with [`KvCache::write`] and reads earlier
/// positions with [`KvCache::layer`]; it must not call
/// [`KvCache::advance`], the engine commits positions once a call succeeded.
///
/// Both calls return one unnormalized score per vocabulary entry, for the
/// last position only.
pub trait ForwardPass {
    /// Model hyperparameters
    fn config(&self) -> &ModelConfig;

    /// Run the whole prompt, starting at position 0 of an empty cache
    fn prime(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> crate::Result<Vec<f32>>;

    /// Run one token at `position`, attending to `0..=position`
    fn step(
        &mut self,
        token: TokenId,
        position: usize,
        cache: &mut KvCache,
    ) -> crate::Result<Vec<f32>>;

    /// Device the cache should live on
    fn device(&self) -> Device {
        Device::Cpu
    }

    /// Element type of the cache
    fn dtype(&self) -> DType {
        DType::F32
    }
}

impl<M: ForwardPass + ?Sized> ForwardPass for Box<M> {
    fn config(&self) -> &ModelConfig {
        (**self).config()
    }

    fn prime(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> crate::Result<Vec<f32>> {
        (**self).prime(tokens, cache)
    }

    fn step(
        &mut self,
        token: TokenId,
        position: usize,
        cache: &mut KvCache,
    ) -> crate::Result<Vec<f32>> {
        (**self).step(token, position, cache)
    }

    fn device(&self) -> Device {
        (**self).device()
    }

    fn dtype(&self) -> DType {
        (**self).dtype()
    }
}
