use crate::ops::SoftMax;
use nalgebra::{DMatrix, DVector};

/// Lower-triangular attention mask of a causal transformer.
///
/// `mask[(q, k)]` is `1` when the query at position `q` may attend to the key at
/// position `k` (i.e. `k <= q`) and `0` otherwise.
#[derive(Clone, Debug)]
pub struct CausalMask {
    mask: DMatrix<f32>,
}

impl CausalMask {
    pub fn new(n_seq: usize) -> Self {
        Self {
            mask: DMatrix::from_fn(n_seq, n_seq, |q, k| if k <= q { 1.0 } else { 0.0 }),
        }
    }

    pub fn n_seq(&self) -> usize {
        self.mask.nrows()
    }

    #[inline]
    pub fn is_visible(&self, query: usize, key: usize) -> bool {
        self.mask[(query, key)] != 0.0
    }

    pub fn as_matrix(&self) -> &DMatrix<f32> {
        &self.mask
    }
}

/// Multi-head causal self-attention over a whole sequence.
pub struct CausalSelfAttention;

impl CausalSelfAttention {
    /// Computes the attention output of every position of a sequence.
    ///
    /// `qkv` is the fused `(3 * n_embd, T)` output of the QKV projection: rows
    /// `[0, n_embd)` are the queries, then the keys, then the values. Each of them is
    /// split into `n_head` contiguous blocks of `n_embd / n_head` rows. The per-head
    /// results are written back into the matching row block of `out` (`(n_embd, T)`).
    pub fn run_cpu(out: &mut DMatrix<f32>, qkv: &DMatrix<f32>, n_head: usize, mask: &CausalMask) {
        let n_embd = qkv.nrows() / 3;
        let seq_len = qkv.ncols();
        let head_size = n_embd / n_head;
        let scale = 1.0 / (head_size as f32).sqrt();

        assert_eq!(out.shape(), (n_embd, seq_len), "Attention: dimension mismatch.");
        assert!(seq_len <= mask.n_seq(), "Attention: sequence exceeds the mask.");

        // att[(key, query)]: one column of scores per query so the softmax runs on columns.
        let mut att = DMatrix::<f32>::zeros(seq_len, seq_len);

        for h in 0..n_head {
            let q = qkv.view((h * head_size, 0), (head_size, seq_len));
            let k = qkv.view((n_embd + h * head_size, 0), (head_size, seq_len));
            let v = qkv.view((2 * n_embd + h * head_size, 0), (head_size, seq_len));

            att.gemm_tr(scale, &k, &q, 0.0);

            for query in 0..seq_len {
                let mut scores = att.column_mut(query);
                for key in 0..seq_len {
                    if !mask.is_visible(query, key) {
                        scores[key] = f32::NEG_INFINITY;
                    }
                }
                SoftMax::run_cpu(&mut scores);
            }

            out.view_mut((h * head_size, 0), (head_size, seq_len))
                .gemm(1.0, &v, &att, 0.0);
        }
    }
}

/// Single-query attention reading keys and values from a KV cache.
pub struct CachedAttention;

impl CachedAttention {
    /// Attention output of the query at position `pos`.
    ///
    /// `key_cache` and `value_cache` are `(n_embd, n_seq)` with one column per
    /// position; only columns `0..=pos` are read, which is what makes the op causal.
    /// `att` is a scratch buffer of at least `pos + 1` elements.
    pub fn run_cpu(
        out: &mut DVector<f32>,
        q: &DVector<f32>,
        key_cache: &DMatrix<f32>,
        value_cache: &DMatrix<f32>,
        att: &mut DVector<f32>,
        n_head: usize,
        pos: usize,
    ) {
        let n_embd = q.len();
        let head_size = n_embd / n_head;
        let scale = 1.0 / (head_size as f32).sqrt();
        let len = pos + 1;

        for h in 0..n_head {
            let q_head = q.rows(h * head_size, head_size);
            let keys = key_cache.view((h * head_size, 0), (head_size, len));
            let values = value_cache.view((h * head_size, 0), (head_size, len));

            let mut scores = att.rows_mut(0, len);
            scores.gemv_tr(scale, &keys, &q_head, 0.0);
            SoftMax::run_cpu(&mut scores);

            out.rows_mut(h * head_size, head_size)
                .gemv(1.0, &values, &scores, 0.0);
        }
    }
}

#[cfg(test)]
mod test {
    use super::{CachedAttention, CausalMask, CausalSelfAttention};
    use crate::ops::SoftMax;
    use nalgebra::{DMatrix, DVector};

    /// Straightforward per-element attention used as a reference.
    fn naive_attention(qkv: &DMatrix<f32>, n_head: usize) -> DMatrix<f32> {
        let n_embd = qkv.nrows() / 3;
        let seq_len = qkv.ncols();
        let hs = n_embd / n_head;
        let mut out = DMatrix::zeros(n_embd, seq_len);

        for h in 0..n_head {
            for t in 0..seq_len {
                let mut scores = DVector::zeros(t + 1);
                for s in 0..=t {
                    let mut dot = 0.0;
                    for i in 0..hs {
                        dot += qkv[(h * hs + i, t)] * qkv[(n_embd + h * hs + i, s)];
                    }
                    scores[s] = dot / (hs as f32).sqrt();
                }
                SoftMax::run_cpu(&mut scores);
                for i in 0..hs {
                    let mut acc = 0.0;
                    for s in 0..=t {
                        acc += scores[s] * qkv[(2 * n_embd + h * hs + i, s)];
                    }
                    out[(h * hs + i, t)] = acc;
                }
            }
        }

        out
    }

    #[test]
    fn mask_is_lower_triangular() {
        let mask = CausalMask::new(4);
        assert!(mask.is_visible(0, 0));
        assert!(mask.is_visible(3, 1));
        assert!(!mask.is_visible(1, 2));
        assert_eq!(mask.as_matrix().sum(), 10.0);
    }

    #[test]
    fn causal_attention_matches_reference() {
        const N_EMBD: usize = 24;
        const N_HEAD: usize = 4;
        const SEQ: usize = 9;

        let qkv = DMatrix::<f32>::new_random(3 * N_EMBD, SEQ)
            - DMatrix::repeat(3 * N_EMBD, SEQ, 0.5);
        let mask = CausalMask::new(16);
        let mut out = DMatrix::zeros(N_EMBD, SEQ);
        CausalSelfAttention::run_cpu(&mut out, &qkv, N_HEAD, &mask);

        approx::assert_relative_eq!(out, naive_attention(&qkv, N_HEAD), epsilon = 1.0e-5);
    }

    #[test]
    fn first_position_copies_its_value() {
        let qkv = DMatrix::<f32>::new_random(3 * 8, 3);
        let mut out = DMatrix::zeros(8, 3);
        CausalSelfAttention::run_cpu(&mut out, &qkv, 2, &CausalMask::new(3));

        // The first query can only see itself.
        approx::assert_relative_eq!(
            out.column(0).into_owned(),
            qkv.column(0).rows(16, 8).into_owned(),
            epsilon = 1.0e-6
        );
    }

    #[test]
    fn cached_attention_matches_full_sequence() {
        const N_EMBD: usize = 16;
        const N_HEAD: usize = 2;
        const SEQ: usize = 6;
        const N_SEQ: usize = 8;

        let qkv = DMatrix::<f32>::new_random(3 * N_EMBD, SEQ);
        let mut full = DMatrix::zeros(N_EMBD, SEQ);
        CausalSelfAttention::run_cpu(&mut full, &qkv, N_HEAD, &CausalMask::new(N_SEQ));

        let mut key_cache = DMatrix::<f32>::zeros(N_EMBD, N_SEQ);
        let mut value_cache = DMatrix::<f32>::zeros(N_EMBD, N_SEQ);
        let mut att = DVector::zeros(N_SEQ);
        let mut out = DVector::zeros(N_EMBD);

        for pos in 0..SEQ {
            let col = qkv.column(pos);
            key_cache
                .column_mut(pos)
                .copy_from(&col.rows(N_EMBD, N_EMBD));
            value_cache
                .column_mut(pos)
                .copy_from(&col.rows(2 * N_EMBD, N_EMBD));
            let q = col.rows(0, N_EMBD).into_owned();

            CachedAttention::run_cpu(
                &mut out,
                &q,
                &key_cache,
                &value_cache,
                &mut att,
                N_HEAD,
                pos,
            );
            approx::assert_relative_eq!(out, full.column(pos).into_owned(), epsilon = 1.0e-5);
        }
    }
}
