//! Token sampling: temperature, repetition penalty and nucleus (top-p) sampling.

use rand::Rng;

use super::GenerationConfig;
use crate::TokenId;

/// `top_p` at or above `1 - TOP_P_EPSILON` disables nucleus sampling.
const TOP_P_EPSILON: f32 = 1e-6;

/// Token sampler for one generation call.
///
/// Holds only the per-call knobs; the random source is supplied by the caller
/// so that a fixed rng state always yields the same token.
#[derive(Debug, Clone)]
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    repetition_penalty: f32,
}

impl Sampler {
    /// Create a new sampler with the given configuration
    pub fn new(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            top_p: config.top_p,
            repetition_penalty: config.repetition_penalty,
        }
    }

    /// Sample a token from a score vector.
    ///
    /// Steps run in a fixed order: temperature scaling, repetition penalty
    /// over `history`, softmax, nucleus truncation, draw. A temperature of
    /// zero returns the arg-max of the raw scores without touching `rng`;
    /// `top_p` of 1 returns the arg-max of the penalized scores.
    pub fn sample<R: Rng>(
        &self,
        scores: &[f32],
        history: &[TokenId],
        rng: &mut R,
    ) -> crate::Result<TokenId> {
        if scores.is_empty() {
            return Err(crate::EmbeeError::BackendFailure(
                "empty score vector".to_string(),
            ));
        }

        if self.temperature == 0.0 {
            return Ok(argmax(scores));
        }

        let mut logits: Vec<f32> = scores.iter().map(|&s| s / self.temperature).collect();
        self.apply_repetition_penalty(&mut logits, history);

        if self.top_p >= 1.0 - TOP_P_EPSILON {
            return Ok(argmax(&logits));
        }

        let Some(probs) = softmax(&logits) else {
            tracing::warn!("degenerate score vector, falling back to arg-max");
            return Ok(argmax(&logits));
        };

        let nucleus = self.nucleus(&probs);
        Ok(sample_from_nucleus(&nucleus, rng))
    }

    /// Apply repetition penalty to logits in place.
    ///
    /// Every occurrence in `history` is penalized: positive logits are divided
    /// by the penalty, non-positive ones multiplied. Ids outside the
    /// vocabulary are skipped.
    pub fn apply_repetition_penalty(&self, logits: &mut [f32], history: &[TokenId]) {
        if self.repetition_penalty == 1.0 {
            return;
        }

        let penalty = self.repetition_penalty;
        for &token in history {
            let Ok(idx) = usize::try_from(token) else {
                continue;
            };
            if let Some(logit) = logits.get_mut(idx) {
                if *logit > 0.0 {
                    *logit /= penalty;
                } else {
                    *logit *= penalty;
                }
            }
        }
    }

    /// The nucleus of a probability vector: `(token index, probability)`
    /// pairs by descending probability, renormalized to sum to 1.
    ///
    /// Ties keep the lower index first. The nucleus is the shortest prefix
    /// whose cumulative probability reaches `top_p`, and never empty.
    pub fn nucleus(&self, probs: &[f32]) -> Vec<(usize, f32)> {
        let mut indexed: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
        // stable: equal probabilities stay in ascending index order
        indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let mut cutoff = indexed.len();
        let mut cumsum = 0.0f32;
        for (i, &(_, prob)) in indexed.iter().enumerate() {
            cumsum += prob;
            if cumsum >= self.top_p {
                cutoff = i + 1;
                break;
            }
        }
        indexed.truncate(cutoff.max(1));

        let norm: f32 = indexed.iter().map(|&(_, p)| p).sum();
        if norm > 0.0 {
            for (_, p) in indexed.iter_mut() {
                *p /= norm;
            }
        }

        indexed
    }
}

/// Index of the highest score; ties go to the lowest index, NaN never wins.
pub fn argmax(scores: &[f32]) -> TokenId {
    let mut best = 0usize;
    let mut best_score = f32::NEG_INFINITY;
    for (idx, &score) in scores.iter().enumerate() {
        if score > best_score {
            best = idx;
            best_score = score;
        }
    }
    best as TokenId
}

/// Numerically stable softmax.
///
/// Returns `None` when the input cannot form a distribution (all `-inf`, an
/// infinite maximum, or NaN).
pub fn softmax(logits: &[f32]) -> Option<Vec<f32>> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return None;
    }

    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if !(sum > 0.0 && sum.is_finite()) {
        return None;
    }

    Some(exps.into_iter().map(|e| e / sum).collect())
}

/// Draw from a renormalized nucleus.
fn sample_from_nucleus<R: Rng>(nucleus: &[(usize, f32)], rng: &mut R) -> TokenId {
    let r: f32 = rng.random();

    let mut cdf = 0.0f32;
    for &(idx, prob) in nucleus {
        cdf += prob;
        if r <= cdf {
            return idx as TokenId;
        }
    }

    // Rounding kept the cdf below r
    nucleus.first().map(|&(idx, _)| idx as TokenId).unwrap_or(0)
}
