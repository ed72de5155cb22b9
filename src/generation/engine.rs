//! The decode loop: prime once, then sample and extend one token at a time.

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{GenerationConfig, KvCache, Sampler};
use crate::model::ForwardPass;
use crate::tokenizer::Tokenizer;
use crate::TokenId;

/// Why a generation call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The sampler produced the end-of-sequence token (not emitted)
    EndOfSequence,
    /// `max_length` tokens were emitted
    MaxLength,
    /// The KV cache ran out of positions
    CacheCapacity,
    /// The callback asked to stop
    Cancelled,
}

/// Where the engine is in its decode state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Priming,
    Decoding,
    Finished(FinishReason),
    /// The last call returned an error; the cache is reset before reuse
    Failed,
}

/// Outcome of one generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationSummary {
    /// Number of prompt tokens fed to the model
    pub prompt_tokens: usize,
    /// Emitted token ids, in order
    pub tokens: Vec<TokenId>,
    pub finish_reason: FinishReason,
}

impl GenerationSummary {
    /// Number of emitted tokens
    pub fn num_tokens(&self) -> usize {
        self.tokens.len()
    }
}

/// Mutable per-engine state, borrowed exclusively by one call at a time.
struct EngineState {
    cache: Option<KvCache>,
    rng: StdRng,
    state: DecodeState,
}

/// Autoregressive text generator over a model and a tokenizer.
///
/// The engine owns one [`KvCache`] sized for the model's maximum sequence
/// length and reuses it across calls. Every call takes `&mut self`, so a
/// single engine never runs two sessions at once.
pub struct Engine<M, T> {
    model: M,
    tokenizer: T,
    inner: EngineState,
}

impl<M: ForwardPass, T: Tokenizer> Engine<M, T> {
    /// Create an engine whose random source is seeded from the OS
    pub fn new(model: M, tokenizer: T) -> crate::Result<Self> {
        Self::with_rng(model, tokenizer, StdRng::from_os_rng())
    }

    /// Create an engine with a reproducible random source
    pub fn with_seed(model: M, tokenizer: T, seed: u64) -> crate::Result<Self> {
        Self::with_rng(model, tokenizer, StdRng::seed_from_u64(seed))
    }

    fn with_rng(model: M, tokenizer: T, rng: StdRng) -> crate::Result<Self> {
        let config = model.config();
        config.validate()?;

        if tokenizer.vocab_size() > config.vocab_size {
            tracing::warn!(
                "Tokenizer vocabulary ({}) is larger than the model's ({})",
                tokenizer.vocab_size(),
                config.vocab_size
            );
        }

        Ok(Self {
            model,
            tokenizer,
            inner: EngineState {
                cache: None,
                rng,
                state: DecodeState::Idle,
            },
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn tokenizer(&self) -> &T {
        &self.tokenizer
    }

    /// State reached by the last call
    pub fn state(&self) -> DecodeState {
        self.inner.state
    }

    /// The engine's KV cache, once a call has allocated it
    pub fn cache(&self) -> Option<&KvCache> {
        self.inner.cache.as_ref()
    }

    /// Forget the previous session, keeping the cache allocation
    pub fn reset(&mut self) {
        if let Some(cache) = self.inner.cache.as_mut() {
            cache.reset();
        }
        self.inner.state = DecodeState::Idle;
    }

    /// Generate text; returns the prompt followed by the generated text
    pub fn generate(&mut self, prompt: &str, config: &GenerationConfig) -> crate::Result<String> {
        self.generate_with_summary(prompt, config)
            .map(|(text, _)| text)
    }

    /// Like [`Engine::generate`], also returning the call summary
    pub fn generate_with_summary(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
    ) -> crate::Result<(String, GenerationSummary)> {
        let mut text = prompt.to_string();
        let summary = self.generate_streaming(prompt, config, |_, fragment| {
            text.push_str(fragment);
            true
        })?;
        Ok((text, summary))
    }

    /// Generate token by token, calling `on_token` after every decode step.
    ///
    /// The callback receives the token id and its decoded text; returning
    /// `false` stops generation after that token.
    pub fn generate_streaming<F>(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
        mut on_token: F,
    ) -> crate::Result<GenerationSummary>
    where
        F: FnMut(TokenId, &str) -> bool,
    {
        config.validate()?;

        let result = self.run(prompt, config, &mut on_token);
        match &result {
            Ok(summary) => {
                self.inner.state = DecodeState::Finished(summary.finish_reason);
                tracing::debug!(
                    tokens = summary.num_tokens(),
                    reason = ?summary.finish_reason,
                    "generation finished"
                );
            }
            Err(e) => {
                self.inner.state = DecodeState::Failed;
                if let Some(cache) = self.inner.cache.as_mut() {
                    cache.invalidate();
                }
                tracing::debug!(error = %e, "generation failed");
            }
        }
        result
    }

    fn run(
        &mut self,
        prompt: &str,
        config: &GenerationConfig,
        on_token: &mut dyn FnMut(TokenId, &str) -> bool,
    ) -> crate::Result<GenerationSummary> {
        let mut tokens = self.encode_prompt(prompt)?;
        let prompt_tokens = tokens.len();

        let Self {
            model,
            tokenizer,
            inner,
        } = self;
        let vocab_size = model.config().vocab_size;
        let eos = tokenizer.eos_token();
        let sampler = Sampler::new(config);

        if let Some(seed) = config.seed {
            inner.rng = StdRng::seed_from_u64(seed);
        }

        let cache = prepare_cache(&mut inner.cache, &*model, config.use_cache)?;

        inner.state = DecodeState::Priming;
        tracing::debug!(prompt_tokens, capacity = cache.capacity(), "priming");
        cache.ensure_room(prompt_tokens)?;
        let mut scores = model.prime(&tokens, cache)?;
        check_scores(&scores, vocab_size)?;
        cache.advance(prompt_tokens)?;

        inner.state = DecodeState::Decoding;
        let mut generated = Vec::new();
        let finish_reason = loop {
            if generated.len() >= config.max_length {
                break FinishReason::MaxLength;
            }

            let token = sampler.sample(&scores, &tokens, &mut inner.rng)?;
            if !(0..vocab_size as TokenId).contains(&token) {
                return Err(crate::EmbeeError::OutOfVocabularyToken { token, vocab_size });
            }
            if eos == Some(token) {
                break FinishReason::EndOfSequence;
            }
            if cache.remaining() == 0 {
                break FinishReason::CacheCapacity;
            }

            tokens.push(token);
            let position = cache.current_length();
            scores = model.step(token, position, cache)?;
            check_scores(&scores, vocab_size)?;
            cache.advance(1)?;
            generated.push(token);

            let fragment = tokenizer.decode(&[token])?;
            if !on_token(token, &fragment) {
                break FinishReason::Cancelled;
            }
        };

        Ok(GenerationSummary {
            prompt_tokens,
            tokens: generated,
            finish_reason,
        })
    }

    /// Scores for the position after `prompt`.
    ///
    /// Primes a scratch cache sized to the prompt; the engine's own cache
    /// and state are left as they were.
    pub fn get_logits(&mut self, prompt: &str) -> crate::Result<Vec<f32>> {
        let tokens = self.encode_prompt(prompt)?;

        let config = self.model.config();
        if tokens.len() > config.max_seq_len {
            return Err(crate::EmbeeError::CacheCapacityExceeded {
                requested: tokens.len(),
                capacity: config.max_seq_len,
            });
        }
        let vocab_size = config.vocab_size;
        let mut scratch = KvCache::with_capacity(
            config,
            tokens.len(),
            &self.model.device(),
            self.model.dtype(),
        )?;

        let scores = self.model.prime(&tokens, &mut scratch)?;
        check_scores(&scores, vocab_size)?;
        Ok(scores)
    }

    /// Encode a prompt, substituting BOS for an empty encoding
    fn encode_prompt(&self, prompt: &str) -> crate::Result<Vec<TokenId>> {
        let mut tokens = self.tokenizer.encode(prompt)?;

        if tokens.is_empty() {
            match self.tokenizer.bos_token() {
                Some(bos) => tokens.push(bos),
                None => {
                    return Err(crate::EmbeeError::TokenizationFailure(
                        "prompt encodes to no tokens and the tokenizer has no BOS token"
                            .to_string(),
                    ))
                }
            }
        }

        let vocab_size = self.model.config().vocab_size;
        if let Some(&token) = tokens
            .iter()
            .find(|&&t| !(0..vocab_size as TokenId).contains(&t))
        {
            return Err(crate::EmbeeError::OutOfVocabularyToken { token, vocab_size });
        }

        Ok(tokens)
    }
}

/// Reset the existing cache, or allocate a fresh one when there is none or
/// reuse is disabled
fn prepare_cache<'a, M: ForwardPass>(
    slot: &'a mut Option<KvCache>,
    model: &M,
    use_cache: bool,
) -> crate::Result<&'a mut KvCache> {
    let cache = match slot.take() {
        Some(mut cache) if use_cache => {
            cache.reset();
            cache
        }
        _ => KvCache::allocate(model.config(), &model.device(), model.dtype())?,
    };
    Ok(slot.insert(cache))
}

fn check_scores(scores: &[f32], vocab_size: usize) -> crate::Result<()> {
    if scores.len() != vocab_size {
        return Err(crate::EmbeeError::BackendFailure(format!(
            "forward pass returned {} scores, expected {}",
            scores.len(),
            vocab_size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::tokenizer::ByteTokenizer;

    /// Forward pass that replays a fixed list of arg-max tokens.
    struct ScriptedModel {
        config: ModelConfig,
        script: Vec<TokenId>,
        calls: usize,
        fail_on_call: Option<usize>,
        score_len: Option<usize>,
        primed: Vec<Vec<TokenId>>,
        steps: Vec<(TokenId, usize)>,
        prime_capacities: Vec<usize>,
        /// Whether each prime found the row left by an earlier prime
        reused_rows: Vec<bool>,
    }

    impl ScriptedModel {
        fn new(vocab_size: usize, max_seq_len: usize, script: Vec<TokenId>) -> Self {
            Self {
                config: ModelConfig::new(vocab_size, 8, 1, 2, 1, max_seq_len),
                script,
                calls: 0,
                fail_on_call: None,
                score_len: None,
                primed: Vec::new(),
                steps: Vec::new(),
                prime_capacities: Vec::new(),
                reused_rows: Vec::new(),
            }
        }

        /// Check row 0 of layer 0 for an earlier marker, then leave a fresh one
        fn mark_cache(&mut self, cache: &mut KvCache) -> crate::Result<()> {
            let (keys, _) = cache.layer(0, 1)?;
            let row: Vec<f32> = keys.flatten_all()?.to_vec1()?;
            self.reused_rows.push(row.iter().all(|&v| v == 1.0));

            let shape = (1, self.config.num_kv_heads(), self.config.head_dim());
            let device = cache.device().clone();
            let marker = candle_core::Tensor::ones(shape, candle_core::DType::F32, &device)?;
            cache.write(0, 0, &marker, &marker)
        }

        /// Scores peaking at the scripted token, with some spread for sampling
        fn next_scores(&mut self) -> crate::Result<Vec<f32>> {
            let call = self.calls;
            self.calls += 1;
            if self.fail_on_call == Some(call) {
                return Err(crate::EmbeeError::BackendFailure("device lost".to_string()));
            }

            let len = self.score_len.unwrap_or(self.config.vocab_size);
            let mut scores: Vec<f32> = (0..len)
                .map(|i| ((i * 7919 + call * 31) % 97) as f32 / 40.0)
                .collect();
            if let Some(&target) = self.script.get(call.min(self.script.len().saturating_sub(1))) {
                if let Some(score) = scores.get_mut(target as usize) {
                    *score = 50.0;
                }
            }
            Ok(scores)
        }
    }

    impl ForwardPass for ScriptedModel {
        fn config(&self) -> &ModelConfig {
            &self.config
        }

        fn prime(&mut self, tokens: &[TokenId], cache: &mut KvCache) -> crate::Result<Vec<f32>> {
            self.primed.push(tokens.to_vec());
            self.prime_capacities.push(cache.capacity());
            self.mark_cache(cache)?;
            self.next_scores()
        }

        fn step(
            &mut self,
            token: TokenId,
            position: usize,
            _cache: &mut KvCache,
        ) -> crate::Result<Vec<f32>> {
            self.steps.push((token, position));
            self.next_scores()
        }
    }

    fn engine(model: ScriptedModel) -> Engine<ScriptedModel, ByteTokenizer> {
        Engine::with_seed(model, ByteTokenizer::new(), 0).unwrap()
    }

    const A: TokenId = b'A' as TokenId;
    const EOS: TokenId = 2;

    #[test]
    fn test_greedy_stops_on_eos() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A, A, EOS]));
        let config = GenerationConfig::greedy().with_max_length(3);

        let (text, summary) = engine.generate_with_summary("Hi", &config).unwrap();

        assert_eq!(text, "HiAA");
        assert_eq!(summary.tokens, vec![A, A]);
        assert_eq!(summary.prompt_tokens, 2);
        assert_eq!(summary.finish_reason, FinishReason::EndOfSequence);
        assert_eq!(engine.state(), DecodeState::Finished(FinishReason::EndOfSequence));

        let model = engine.model();
        assert_eq!(model.primed, vec![vec![b'H' as TokenId, b'i' as TokenId]]);
        assert_eq!(model.steps, vec![(A, 2), (A, 3)]);
        assert_eq!(engine.cache().unwrap().current_length(), 4);
    }

    #[test]
    fn test_max_length_bounds_emissions() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A]));
        let config = GenerationConfig::greedy().with_max_length(3);

        let (text, summary) = engine.generate_with_summary("Hi", &config).unwrap();
        assert_eq!(text, "HiAAA");
        assert_eq!(summary.finish_reason, FinishReason::MaxLength);
        assert_eq!(summary.num_tokens(), 3);
    }

    #[test]
    fn test_disabled_cache_is_reallocated_per_call() {
        let config = GenerationConfig::greedy().with_max_length(3);
        let uncached_config = config.clone().with_cache(false);

        let mut cached = engine(ScriptedModel::new(256, 64, vec![A]));
        let mut uncached = engine(ScriptedModel::new(256, 64, vec![A]));

        let expected = cached.generate("Hi", &config).unwrap();
        assert_eq!(cached.generate("Hi", &config).unwrap(), expected);
        assert_eq!(uncached.generate("Hi", &uncached_config).unwrap(), expected);
        assert_eq!(uncached.generate("Hi", &uncached_config).unwrap(), expected);
        assert_eq!(expected, "HiAAA");

        // the reused cache still holds the first call's row
        assert_eq!(cached.model().reused_rows, vec![false, true]);
        assert_eq!(uncached.model().reused_rows, vec![false, false]);
        assert_eq!(uncached.model().prime_capacities, vec![64, 64]);
        assert_eq!(uncached.cache().unwrap().current_length(), 5);
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let config = GenerationConfig::default()
            .with_max_length(20)
            .with_seed(1234);

        // no scripted token: every score comes from the spread
        let mut first = engine(ScriptedModel::new(256, 64, Vec::new()));
        let mut second = engine(ScriptedModel::new(256, 64, Vec::new()));

        let a = first.generate_with_summary("seed", &config).unwrap().1;
        let b = second.generate_with_summary("seed", &config).unwrap().1;
        assert_eq!(a.tokens, b.tokens);

        // the engine rng is reseeded per call, so a second call repeats itself
        let c = first.generate_with_summary("seed", &config).unwrap().1;
        assert_eq!(a.tokens, c.tokens);
    }

    #[test]
    fn test_streaming_matches_generate() {
        let config = GenerationConfig::default().with_max_length(16).with_seed(99);
        let mut engine = engine(ScriptedModel::new(256, 64, Vec::new()));

        let text = engine.generate("Hello", &config).unwrap();

        let mut streamed = String::from("Hello");
        let mut ids = Vec::new();
        let summary = engine
            .generate_streaming("Hello", &config, |token, fragment| {
                ids.push(token);
                streamed.push_str(fragment);
                true
            })
            .unwrap();

        assert_eq!(text, streamed);
        assert_eq!(ids, summary.tokens);
    }

    #[test]
    fn test_cancel_after_first_token() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A]));
        let config = GenerationConfig::greedy().with_max_length(10);

        let mut seen = 0;
        let summary = engine
            .generate_streaming("Hi", &config, |_, _| {
                seen += 1;
                false
            })
            .unwrap();

        assert_eq!(seen, 1);
        assert_eq!(summary.tokens, vec![A]);
        assert_eq!(summary.finish_reason, FinishReason::Cancelled);
    }

    #[test]
    fn test_cache_capacity_ends_generation() {
        let mut engine = engine(ScriptedModel::new(256, 4, vec![A]));
        let config = GenerationConfig::greedy().with_max_length(10);

        let (text, summary) = engine.generate_with_summary("Hi", &config).unwrap();
        assert_eq!(text, "HiAA");
        assert_eq!(summary.finish_reason, FinishReason::CacheCapacity);
        assert!(engine.cache().unwrap().is_full());

        // a prompt that cannot even be primed is an error
        let err = engine.generate("Hello", &config).unwrap_err();
        assert!(matches!(
            err,
            crate::EmbeeError::CacheCapacityExceeded { requested: 5, capacity: 4 }
        ));
        assert_eq!(engine.state(), DecodeState::Failed);
    }

    #[test]
    fn test_without_eos_token_generation_continues() {
        let tokenizer = ByteTokenizer::with_special_tokens(None, None, None);
        let model = ScriptedModel::new(256, 64, vec![EOS]);
        let mut engine = Engine::with_seed(model, tokenizer, 0).unwrap();
        let config = GenerationConfig::greedy().with_max_length(4);

        let summary = engine.generate_streaming("x", &config, |_, _| true).unwrap();
        assert_eq!(summary.tokens, vec![EOS; 4]);
        assert_eq!(summary.finish_reason, FinishReason::MaxLength);
    }

    #[test]
    fn test_invalid_config_rejected_before_forward_pass() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A]));

        let config = GenerationConfig::default().with_top_p(0.0);
        assert!(matches!(
            engine.generate("Hi", &config),
            Err(crate::EmbeeError::InvalidConfig(_))
        ));
        let config = GenerationConfig::default().with_temperature(f32::NAN);
        assert!(engine.generate("Hi", &config).is_err());

        assert_eq!(engine.model().calls, 0);
        assert_eq!(engine.state(), DecodeState::Idle);
    }

    #[test]
    fn test_backend_failure_invalidates_cache() {
        let mut model = ScriptedModel::new(256, 64, vec![A]);
        model.fail_on_call = Some(2);
        let mut engine = engine(model);
        let config = GenerationConfig::greedy().with_max_length(5);

        let mut emitted = 0;
        let err = engine
            .generate_streaming("Hi", &config, |_, _| {
                emitted += 1;
                true
            })
            .unwrap_err();
        assert!(matches!(err, crate::EmbeeError::BackendFailure(_)));
        assert_eq!(emitted, 1);
        assert_eq!(engine.state(), DecodeState::Failed);
        assert!(engine.cache().unwrap().needs_reset());

        // the next call starts from a clean cache
        let text = engine.generate("Hi", &config).unwrap();
        assert_eq!(text, "HiAAAAA");
        assert!(!engine.cache().unwrap().needs_reset());
        assert_eq!(engine.model().primed.len(), 2);
    }

    #[test]
    fn test_wrong_score_length_is_backend_failure() {
        let mut model = ScriptedModel::new(256, 64, vec![A]);
        model.score_len = Some(255);
        let mut engine = engine(model);

        assert!(matches!(
            engine.generate("Hi", &GenerationConfig::greedy()),
            Err(crate::EmbeeError::BackendFailure(_))
        ));
        assert!(matches!(
            engine.get_logits("Hi"),
            Err(crate::EmbeeError::BackendFailure(_))
        ));
    }

    #[test]
    fn test_get_logits_uses_scratch_cache() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A, A, EOS]));
        engine
            .generate("Hi", &GenerationConfig::greedy().with_max_length(3))
            .unwrap();
        let state = engine.state();
        let cached = engine.cache().unwrap().current_length();

        let scores = engine.get_logits("Hey").unwrap();
        assert_eq!(scores.len(), 256);

        assert_eq!(engine.state(), state);
        assert_eq!(engine.cache().unwrap().current_length(), cached);
        assert_eq!(engine.model().prime_capacities, vec![64, 3]);
    }

    #[test]
    fn test_empty_prompt_uses_bos() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![EOS]));
        let summary = engine
            .generate_streaming("", &GenerationConfig::greedy(), |_, _| true)
            .unwrap();
        assert_eq!(summary.prompt_tokens, 1);
        assert_eq!(engine.model().primed, vec![vec![1]]);

        let tokenizer = ByteTokenizer::with_special_tokens(None, Some(EOS), None);
        let mut engine =
            Engine::with_seed(ScriptedModel::new(256, 64, vec![EOS]), tokenizer, 0).unwrap();
        assert!(matches!(
            engine.generate("", &GenerationConfig::greedy()),
            Err(crate::EmbeeError::TokenizationFailure(_))
        ));
        assert_eq!(engine.model().calls, 0);
    }

    #[test]
    fn test_prompt_outside_vocabulary_is_rejected() {
        let mut engine = engine(ScriptedModel::new(128, 64, vec![A]));
        let err = engine.generate("é", &GenerationConfig::greedy()).unwrap_err();
        assert!(matches!(
            err,
            crate::EmbeeError::OutOfVocabularyToken { vocab_size: 128, .. }
        ));
        assert_eq!(engine.model().calls, 0);
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut engine = engine(ScriptedModel::new(256, 64, vec![A]));
        engine
            .generate("Hi", &GenerationConfig::greedy().with_max_length(2))
            .unwrap();
        assert_eq!(engine.cache().unwrap().current_length(), 4);

        engine.reset();
        assert_eq!(engine.state(), DecodeState::Idle);
        assert!(engine.cache().unwrap().is_empty());
    }
}
