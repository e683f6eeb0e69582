//! Next-token sampling.

use crate::ops::SoftMax;
use nalgebra::DVector;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Picks the next token from a vector of logits.
///
/// Sampling applies, in order: temperature scaling, softmax, top-k truncation,
/// nucleus (top-p) truncation and a multinomial draw. A temperature of zero
/// always selects the most likely token.
pub struct Sampler {
    n_vocab: usize,
    temperature: f32,
    top_p: f32,
    top_k: Option<usize>,
    rng: StdRng,
    // Scratch buffer of (token, probability) sorted by decreasing probability.
    candidates: Vec<(usize, f32)>,
}

impl Sampler {
    pub fn new(n_vocab: usize, temperature: f32, top_p: f32) -> Self {
        Self {
            n_vocab,
            temperature: temperature.max(0.0),
            top_p,
            top_k: None,
            rng: StdRng::from_entropy(),
            candidates: Vec::with_capacity(n_vocab),
        }
    }

    /// Only sample among the `k` most likely tokens. `0` disables the truncation.
    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = (k > 0).then_some(k);
        self
    }

    /// Makes the sampling reproducible.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn temperature(&self) -> f32 {
        self.temperature
    }

    pub fn top_p(&self) -> f32 {
        self.top_p
    }

    pub fn top_k(&self) -> Option<usize> {
        self.top_k
    }

    /// Index of the largest logit.
    pub fn argmax(logits: &DVector<f32>) -> usize {
        logits.imax()
    }

    /// Samples a token. `logits` is used as scratch space and is overwritten
    /// with the token probabilities.
    pub fn sample(&mut self, logits: &mut DVector<f32>) -> usize {
        assert_eq!(logits.len(), self.n_vocab, "Sampler: vocabulary size mismatch.");

        if self.temperature == 0.0 {
            return Self::argmax(logits);
        }

        let greedy = Self::argmax(logits);
        *logits /= self.temperature;
        SoftMax::run_cpu(logits);

        // Tiny temperatures overflow the scaled logits.
        if logits.iter().any(|p| !p.is_finite()) {
            return greedy;
        }

        let truncate_p = self.top_p > 0.0 && self.top_p < 1.0;
        if self.top_k.is_none() && !truncate_p {
            let coin = self.rng.gen::<f32>();
            return Self::sample_mult(logits.as_slice(), coin);
        }

        self.candidates.clear();
        self.candidates.extend(logits.iter().copied().enumerate());
        self.candidates.sort_unstable_by(|a, b| b.1.total_cmp(&a.1));

        let mut keep = self
            .top_k
            .map_or(self.candidates.len(), |k| k.min(self.candidates.len()));
        let mass: f32 = self.candidates[..keep].iter().map(|c| c.1).sum();

        if truncate_p {
            let mut cumulative = 0.0;
            for (i, c) in self.candidates[..keep].iter().enumerate() {
                cumulative += c.1 / mass;
                if cumulative > self.top_p {
                    keep = i + 1;
                    break;
                }
            }
        }

        let kept = &self.candidates[..keep];
        let total: f32 = kept.iter().map(|c| c.1).sum();
        let r = self.rng.gen::<f32>() * total;
        let mut cdf = 0.0;
        for c in kept {
            cdf += c.1;
            if r < cdf {
                return c.0;
            }
        }

        // In case of rounding errors.
        kept[keep - 1].0
    }

    /// Samples an index from the probabilities `probs` (must sum to 1), given
    /// `coin`, a random number in `[0, 1)`.
    fn sample_mult(probs: &[f32], coin: f32) -> usize {
        let mut cdf = 0.0;
        for (i, p) in probs.iter().enumerate() {
            cdf += *p;
            if coin < cdf {
                return i;
            }
        }
        probs.len() - 1
    }
}
