use crate::models::gpt2::{Gpt2Params, Gpt2Weights};
use crate::models::sampler::Sampler;
use crate::ops::{
    CachedAttention, CausalMask, CausalSelfAttention, LayerNorm, Linear, SoftMax, Unary,
};
use crate::Gpt2Error;
use nalgebra::{DMatrix, DVector, Dyn, StorageMut, Vector};
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Buffers for single-token (incremental) inference, including the KV cache.
pub struct Gpt2State {
    /// Residual stream at the current position.
    x: DVector<f32>,
    /// Normalized activation, also reused for the attention output.
    xb: DVector<f32>,
    /// Output of the residual branch projections.
    xb2: DVector<f32>,
    /// Fused query/key/value projection.
    qkv: DVector<f32>,
    q: DVector<f32>,
    /// Hidden activation of the feed-forward network.
    hb: DVector<f32>,
    /// Attention scores.
    att: DVector<f32>,
    logits: DVector<f32>,
    // KV cache. Each Vec contains `n_layer` elements of size `(n_embd, n_seq)`.
    key_cache: Vec<DMatrix<f32>>,
    value_cache: Vec<DMatrix<f32>>,
}

impl Gpt2State {
    pub fn new(config: &Gpt2Params) -> Self {
        Self {
            x: DVector::zeros(config.n_embd),
            xb: DVector::zeros(config.n_embd),
            xb2: DVector::zeros(config.n_embd),
            qkv: DVector::zeros(config.attn_b),
            q: DVector::zeros(config.n_embd),
            hb: DVector::zeros(config.ff_len),
            att: DVector::zeros(config.n_seq),
            logits: DVector::zeros(config.n_vocab),
            key_cache: (0..config.n_layer)
                .map(|_| DMatrix::zeros(config.n_embd, config.n_seq))
                .collect(),
            value_cache: (0..config.n_layer)
                .map(|_| DMatrix::zeros(config.n_embd, config.n_seq))
                .collect(),
        }
    }

    /// Logits computed by the last call to [`Gpt2::forward_token`].
    pub fn logits(&self) -> &DVector<f32> {
        &self.logits
    }

    fn matches(&self, config: &Gpt2Params) -> bool {
        self.x.len() == config.n_embd
            && self.hb.len() == config.ff_len
            && self.logits.len() == config.n_vocab
            && self.key_cache.len() == config.n_layer
            && self.key_cache.iter().all(|k| k.ncols() == config.n_seq)
    }
}

/// A GPT-2 language model: weights, hyperparameters and the causal mask.
pub struct Gpt2 {
    params: Gpt2Params,
    weights: Gpt2Weights,
    mask: CausalMask,
}

impl Gpt2 {
    pub fn new(params: Gpt2Params, weights: Gpt2Weights) -> Result<Self, Gpt2Error> {
        params.validate()?;
        weights.check_shapes(&params)?;

        Ok(Self {
            mask: CausalMask::new(params.n_seq),
            params,
            weights,
        })
    }

    /// A randomly initialized model. See [`Gpt2Weights::new_random`].
    pub fn new_random(params: Gpt2Params, seed: u64) -> Result<Self, Gpt2Error> {
        params.validate()?;
        let weights = Gpt2Weights::new_random(&params, &mut StdRng::seed_from_u64(seed));
        Self::new(params, weights)
    }

    pub fn params(&self) -> &Gpt2Params {
        &self.params
    }

    pub fn weights(&self) -> &Gpt2Weights {
        &self.weights
    }

    pub fn mask(&self) -> &CausalMask {
        &self.mask
    }

    fn check_token(&self, token: usize) -> Result<(), Gpt2Error> {
        if token >= self.params.n_vocab {
            Err(Gpt2Error::TokenOutOfRange {
                token,
                n_vocab: self.params.n_vocab,
            })
        } else {
            Ok(())
        }
    }

    fn check_sequence(&self, tokens: &[usize]) -> Result<(), Gpt2Error> {
        if tokens.is_empty() {
            return Err(Gpt2Error::EmptySequence);
        }
        if tokens.len() > self.params.n_seq {
            return Err(Gpt2Error::SequenceTooLong {
                len: tokens.len(),
                max: self.params.n_seq,
            });
        }
        tokens.iter().try_for_each(|tok| self.check_token(*tok))
    }

    /// Token embedding plus position embedding.
    fn embed<S: StorageMut<f32, Dyn>>(&self, out: &mut Vector<f32, Dyn, S>, token: usize, pos: usize) {
        out.copy_from(&self.weights.wte.column(token));
        *out += &self.weights.wpe.column(pos);
    }

    /// Runs the transformer on a whole sequence.
    ///
    /// Returns the `(n_vocab, T)` logits: column `t` is the prediction of the token
    /// following `tokens[t]`, computed from `tokens[..=t]` only.
    pub fn forward(&self, tokens: &[usize]) -> Result<DMatrix<f32>, Gpt2Error> {
        self.check_sequence(tokens)?;

        let config = &self.params;
        let eps = config.layer_norm_eps;
        let seq_len = tokens.len();

        let mut x = DMatrix::zeros(config.n_embd, seq_len);
        for (pos, token) in tokens.iter().enumerate() {
            self.embed(&mut x.column_mut(pos), *token, pos);
        }

        let mut h = DMatrix::zeros(config.n_embd, seq_len);
        let mut qkv = DMatrix::zeros(config.attn_b, seq_len);
        let mut att_out = DMatrix::zeros(config.n_embd, seq_len);
        let mut proj = DMatrix::zeros(config.n_embd, seq_len);
        let mut ff = DMatrix::zeros(config.ff_len, seq_len);

        for layer in &self.weights.layers {
            // x = x + attn(ln_1(x))
            LayerNorm::run_cpu_columns(&mut h, &x, &layer.ln_1_g, &layer.ln_1_b, eps);
            Linear::run_cpu(&mut qkv, &layer.c_attn_w, Some(&layer.c_attn_b), &h);
            CausalSelfAttention::run_cpu(&mut att_out, &qkv, config.n_head, &self.mask);
            Linear::run_cpu(&mut proj, &layer.c_proj_w, Some(&layer.c_proj_b), &att_out);
            x += &proj;

            // x = x + mlp(ln_2(x))
            LayerNorm::run_cpu_columns(&mut h, &x, &layer.ln_2_g, &layer.ln_2_b, eps);
            Linear::run_cpu(&mut ff, &layer.c_fc_w, Some(&layer.c_fc_b), &h);
            Unary::run_cpu_inplace(config.activation, &mut ff);
            Linear::run_cpu(&mut proj, &layer.mlp_proj_w, Some(&layer.mlp_proj_b), &ff);
            x += &proj;
        }

        LayerNorm::run_cpu_columns(&mut h, &x, &self.weights.ln_f_g, &self.weights.ln_f_b, eps);

        // NOTE: GPT2 shares the lm_head tensor with wte.
        let mut logits = DMatrix::zeros(config.n_vocab, seq_len);
        logits.gemm_tr(1.0, &self.weights.wte, &h, 0.0);
        Ok(logits)
    }

    /// Runs [`Gpt2::forward`] on every sequence of a batch. All the sequences must
    /// have the same length.
    pub fn forward_batch<S: AsRef<[usize]>>(
        &self,
        batch: &[S],
    ) -> Result<Vec<DMatrix<f32>>, Gpt2Error> {
        Self::check_batch(batch)?;
        batch.iter().map(|s| self.forward(s.as_ref())).collect()
    }

    /// All the sequences of a batch must have the same length.
    fn check_batch<S: AsRef<[usize]>>(batch: &[S]) -> Result<(), Gpt2Error> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let seq_len = first.as_ref().len();
        if let Some(ragged) = batch.iter().find(|s| s.as_ref().len() != seq_len) {
            return Err(Gpt2Error::LengthMismatch {
                expected: seq_len,
                found: ragged.as_ref().len(),
            });
        }
        Ok(())
    }

    /// Mean cross-entropy of predicting `targets[t]` after `tokens[..=t]`.
    pub fn loss(&self, tokens: &[usize], targets: &[usize]) -> Result<f32, Gpt2Error> {
        Ok(self.loss_sum(tokens, targets)? / targets.len() as f32)
    }

    /// Mean cross-entropy over every position of every sequence of a batch.
    pub fn loss_batch<S: AsRef<[usize]>>(
        &self,
        inputs: &[S],
        targets: &[S],
    ) -> Result<f32, Gpt2Error> {
        if inputs.len() != targets.len() {
            return Err(Gpt2Error::LengthMismatch {
                expected: inputs.len(),
                found: targets.len(),
            });
        }
        if inputs.is_empty() {
            return Err(Gpt2Error::EmptySequence);
        }
        Self::check_batch(inputs)?;
        Self::check_batch(targets)?;

        let mut total = 0.0;
        let mut count = 0;
        for (input, target) in inputs.iter().zip(targets) {
            total += self.loss_sum(input.as_ref(), target.as_ref())?;
            count += target.as_ref().len();
        }
        Ok(total / count as f32)
    }

    fn loss_sum(&self, tokens: &[usize], targets: &[usize]) -> Result<f32, Gpt2Error> {
        if tokens.len() != targets.len() {
            return Err(Gpt2Error::LengthMismatch {
                expected: tokens.len(),
                found: targets.len(),
            });
        }
        targets.iter().try_for_each(|tok| self.check_token(*tok))?;

        let mut logits = self.forward(tokens)?;
        let mut total = 0.0;
        for (t, target) in targets.iter().enumerate() {
            let mut log_probs = logits.column_mut(t);
            SoftMax::log_softmax_cpu(&mut log_probs);
            total -= log_probs[*target];
        }
        Ok(total)
    }

    /// Probability distribution of the token following `tokens`.
    pub fn next_token_distribution(&self, tokens: &[usize]) -> Result<DVector<f32>, Gpt2Error> {
        let logits = self.forward(tokens)?;
        let mut probs = logits.column(tokens.len() - 1).into_owned();
        SoftMax::run_cpu(&mut probs);
        Ok(probs)
    }

    /// Runs the transformer on a single token at position `pos`, reusing the keys
    /// and values cached in `state` for the positions `0..pos`.
    ///
    /// Returns the logits of the next token. Feeding a sequence token by token
    /// yields the same logits as the columns of [`Gpt2::forward`].
    pub fn forward_token<'s>(
        &self,
        state: &'s mut Gpt2State,
        token: usize,
        pos: usize,
    ) -> Result<&'s DVector<f32>, Gpt2Error> {
        let config = &self.params;
        self.check_token(token)?;
        if pos >= config.n_seq {
            return Err(Gpt2Error::SequenceTooLong {
                len: pos + 1,
                max: config.n_seq,
            });
        }
        if !state.matches(config) {
            return Err(Gpt2Error::InvalidConfig(
                "the inference state doesn't match the model hyperparameters".to_string(),
            ));
        }

        let n_embd = config.n_embd;
        let eps = config.layer_norm_eps;

        // Positional encoding.
        self.embed(&mut state.x, token, pos);

        for (i_layer, layer) in self.weights.layers.iter().enumerate() {
            // attn
            LayerNorm::run_cpu(&mut state.xb, &state.x, &layer.ln_1_g, &layer.ln_1_b, eps);
            Linear::run_cpu_vec(&mut state.qkv, &layer.c_attn_w, Some(&layer.c_attn_b), &state.xb);

            // self-attention
            {
                let key_cache = &mut state.key_cache[i_layer];
                let value_cache = &mut state.value_cache[i_layer];
                state.q.copy_from(&state.qkv.rows(0, n_embd));
                key_cache
                    .column_mut(pos)
                    .copy_from(&state.qkv.rows(n_embd, n_embd));
                value_cache
                    .column_mut(pos)
                    .copy_from(&state.qkv.rows(2 * n_embd, n_embd));

                CachedAttention::run_cpu(
                    &mut state.xb,
                    &state.q,
                    key_cache,
                    value_cache,
                    &mut state.att,
                    config.n_head,
                    pos,
                );
            }

            // projection, then add the input.
            Linear::run_cpu_vec(&mut state.xb2, &layer.c_proj_w, Some(&layer.c_proj_b), &state.xb);
            state.x += &state.xb2;

            // feed-forward network
            LayerNorm::run_cpu(&mut state.xb, &state.x, &layer.ln_2_g, &layer.ln_2_b, eps);
            Linear::run_cpu_vec(&mut state.hb, &layer.c_fc_w, Some(&layer.c_fc_b), &state.xb);
            Unary::run_cpu_inplace(config.activation, &mut state.hb);
            Linear::run_cpu_vec(
                &mut state.xb2,
                &layer.mlp_proj_w,
                Some(&layer.mlp_proj_b),
                &state.hb,
            );
            state.x += &state.xb2;
        }

        LayerNorm::run_cpu(
            &mut state.xb,
            &state.x,
            &self.weights.ln_f_g,
            &self.weights.ln_f_b,
            eps,
        );
        state.logits.gemv_tr(1.0, &self.weights.wte, &state.xb, 0.0);
        Ok(&state.logits)
    }

    /// Autoregressively samples up to `max_new_tokens` tokens following `prompt`.
    ///
    /// The prompt goes through the KV cache first. Once the context is full, the
    /// window slides: the cache is rebuilt from the last `n_seq - 1` tokens so the
    /// model always conditions on the last `n_seq` tokens. Generation stops after
    /// emitting `stop_token` or when `on_token` returns `false`.
    ///
    /// Returns the generated tokens (without the prompt).
    pub fn generate(
        &self,
        prompt: &[usize],
        max_new_tokens: usize,
        sampler: &mut Sampler,
        stop_token: Option<usize>,
        mut on_token: impl FnMut(usize) -> bool,
    ) -> Result<Vec<usize>, Gpt2Error> {
        if prompt.is_empty() {
            return Err(Gpt2Error::EmptySequence);
        }

        let n_seq = self.params.n_seq;
        let mut state = Gpt2State::new(&self.params);
        let mut tokens = prompt.to_vec();
        let mut generated = vec![];
        let mut logits = DVector::zeros(self.params.n_vocab);

        let context_start = tokens.len().saturating_sub(n_seq);
        let mut pos = 0;
        for token in &prompt[context_start..] {
            logits.copy_from(self.forward_token(&mut state, *token, pos)?);
            pos += 1;
        }
        log::debug!("prefilled {} prompt tokens", pos);

        while generated.len() < max_new_tokens {
            let next = sampler.sample(&mut logits);
            generated.push(next);
            tokens.push(next);

            // The stop token is still reported to `on_token`.
            let keep_going = on_token(next);
            if stop_token == Some(next) || !keep_going || generated.len() == max_new_tokens {
                break;
            }

            if pos == n_seq {
                log::debug!("context full, sliding the window");
                pos = 0;
                let window = &tokens[tokens.len() - n_seq..tokens.len() - 1];
                for token in window {
                    self.forward_token(&mut state, *token, pos)?;
                    pos += 1;
                }
            }

            logits.copy_from(self.forward_token(&mut state, next, pos)?);
            pos += 1;
        }

        Ok(generated)
    }
}
