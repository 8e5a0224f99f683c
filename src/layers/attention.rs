//! Causal Self-Attention Head
//!
//! One head of scaled dot-product attention:
//!
//! ```text
//! Q, K, V = x @ W_q, x @ W_k, x @ W_v        (no bias)
//! scores  = (Q @ K^T) / √head_size
//! scores[i, j] = -inf  where j > i            (causal mask)
//! weights = softmax(scores)                   (per row)
//! output  = dropout(weights) @ V
//! ```
//!
//! The input holds `batch` sequences of `seq_len` rows stacked into one
//! `[batch * seq_len, n_embd]` matrix. Projections run on the whole matrix;
//! the `[seq_len, seq_len]` attention itself runs per sequence, in parallel
//! across the batch.
//!
//! ## Causal Mask
//!
//! The mask is a lower-triangular `block_size × block_size` boolean matrix,
//! built once and shared by every head. Only its top-left
//! `seq_len × seq_len` corner is consulted, so sequences shorter than
//! `block_size` work unchanged. Because the diagonal is always allowed, every
//! softmax row has a finite maximum and masked positions get a weight of
//! exactly zero.
//!
//! ## Backward Pass
//!
//! 1. Through `weights @ V` (gradients for the dropped weights and V)
//! 2. Through dropout
//! 3. Through the row softmax: `grad_s = w * (grad_w - sum(grad_w * w))`
//! 4. Through the scaled `Q @ K^T`
//! 5. Through the three projections, summing their input gradients

use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache};
use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;
use std::sync::Arc;

/// Lower-triangular "may attend" matrix of size `block_size × block_size`.
#[derive(Debug)]
pub struct CausalMask {
    block_size: usize,
    allowed: Vec<bool>,
}

impl CausalMask {
    pub fn new(block_size: usize) -> Self {
        let mut allowed = vec![false; block_size * block_size];
        for i in 0..block_size {
            for j in 0..=i {
                allowed[i * block_size + j] = true;
            }
        }
        Self {
            block_size,
            allowed,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Whether query position `i` may attend to key position `j`.
    pub fn allows(&self, i: usize, j: usize) -> bool {
        self.allowed[i * self.block_size + j]
    }
}

/// A single causal self-attention head.
#[derive(Clone, Debug)]
pub struct AttentionHead {
    pub key: Linear,
    pub query: Linear,
    pub value: Linear,
    pub dropout: Dropout,
    pub head_size: usize,
    mask: Arc<CausalMask>,
}

impl AttentionHead {
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        head_size: usize,
        dropout: f32,
        mask: Arc<CausalMask>,
        rng: &mut R,
    ) -> Self {
        Self {
            key: Linear::new(n_embd, head_size, false, rng),
            query: Linear::new(n_embd, head_size, false, rng),
            value: Linear::new(n_embd, head_size, false, rng),
            dropout: Dropout::new(dropout),
            head_size,
            mask,
        }
    }

    /// Forward pass: `[batch * seq_len, n_embd] -> [batch * seq_len, head_size]`.
    pub fn forward(&self, x: &Tensor, batch: usize, seq_len: usize) -> (Tensor, HeadCache) {
        assert!(
            seq_len <= self.mask.block_size(),
            "sequence length {} exceeds block size {}",
            seq_len,
            self.mask.block_size()
        );
        assert_eq!(x.rows(), batch * seq_len, "input rows must equal batch * seq_len");

        let (k, k_cache) = self.key.forward(x);
        let (q, q_cache) = self.query.forward(x);
        let (v, v_cache) = self.value.forward(x);
        let scale = (self.head_size as f32).powf(-0.5);

        let per_sequence: Vec<(Tensor, Tensor, Tensor, DropoutCache)> = (0..batch)
            .into_par_iter()
            .map(|b| {
                let qb = q.row_block(b * seq_len, seq_len);
                let kb = k.row_block(b * seq_len, seq_len);
                let vb = v.row_block(b * seq_len, seq_len);

                let mut scores = qb.matmul(&kb.transpose()).mul_scalar(scale);
                for i in 0..seq_len {
                    for j in 0..seq_len {
                        if !self.mask.allows(i, j) {
                            scores.data[i * seq_len + j] = f32::NEG_INFINITY;
                        }
                    }
                }

                let weights = scores.softmax_rows();
                let (dropped, dropout_cache) = self.dropout.forward(&weights);
                let out = dropped.matmul(&vb);
                (out, weights, dropped, dropout_cache)
            })
            .collect();

        let mut outputs = Vec::with_capacity(batch);
        let mut weights = Vec::with_capacity(batch);
        let mut dropped_weights = Vec::with_capacity(batch);
        let mut dropout_caches = Vec::with_capacity(batch);
        for (out, w, dropped, dropout_cache) in per_sequence {
            outputs.push(out);
            weights.push(w);
            dropped_weights.push(dropped);
            dropout_caches.push(dropout_cache);
        }

        let cache = HeadCache {
            batch,
            seq_len,
            q,
            k,
            v,
            weights,
            dropped_weights,
            dropout_caches,
            k_cache,
            q_cache,
            v_cache,
        };
        (Tensor::stack_rows(&outputs), cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &HeadCache) -> HeadGradients {
        let seq_len = cache.seq_len;
        let scale = (self.head_size as f32).powf(-0.5);

        let per_sequence: Vec<(Tensor, Tensor, Tensor)> = (0..cache.batch)
            .into_par_iter()
            .map(|b| {
                let g = grad_out.row_block(b * seq_len, seq_len);
                let qb = cache.q.row_block(b * seq_len, seq_len);
                let kb = cache.k.row_block(b * seq_len, seq_len);
                let vb = cache.v.row_block(b * seq_len, seq_len);
                let weights = &cache.weights[b];

                let grad_v = cache.dropped_weights[b].transpose().matmul(&g);
                let grad_dropped = g.matmul(&vb.transpose());
                let grad_weights = self
                    .dropout
                    .backward(&grad_dropped, &cache.dropout_caches[b]);

                let mut grad_scores = vec![0.0; seq_len * seq_len];
                for i in 0..seq_len {
                    let row = i * seq_len..(i + 1) * seq_len;
                    let w_row = &weights.data[row.clone()];
                    let gw_row = &grad_weights.data[row];
                    let dot: f32 = w_row.iter().zip(gw_row).map(|(w, gw)| w * gw).sum();
                    for j in 0..seq_len {
                        grad_scores[i * seq_len + j] = w_row[j] * (gw_row[j] - dot) * scale;
                    }
                }
                let grad_scores = Tensor::new(grad_scores, vec![seq_len, seq_len]);

                let grad_q = grad_scores.matmul(&kb);
                let grad_k = grad_scores.transpose().matmul(&qb);
                (grad_q, grad_k, grad_v)
            })
            .collect();

        let mut grad_q = Vec::with_capacity(cache.batch);
        let mut grad_k = Vec::with_capacity(cache.batch);
        let mut grad_v = Vec::with_capacity(cache.batch);
        for (gq, gk, gv) in per_sequence {
            grad_q.push(gq);
            grad_k.push(gk);
            grad_v.push(gv);
        }

        let k_grads = self
            .key
            .backward(&Tensor::stack_rows(&grad_k), &cache.k_cache);
        let q_grads = self
            .query
            .backward(&Tensor::stack_rows(&grad_q), &cache.q_cache);
        let v_grads = self
            .value
            .backward(&Tensor::stack_rows(&grad_v), &cache.v_cache);

        let mut grad_x = k_grads.x;
        grad_x.add_assign(&q_grads.x);
        grad_x.add_assign(&v_grads.x);

        HeadGradients {
            key: k_grads.weight,
            query: q_grads.weight,
            value: v_grads.weight,
            x: grad_x,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }
}

impl Visit for AttentionHead {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.key.visit(&join(prefix, "key"), f);
        self.query.visit(&join(prefix, "query"), f);
        self.value.visit(&join(prefix, "value"), f);
    }
}

impl VisitMut for AttentionHead {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        self.key.visit_mut(&join(prefix, "key"), f);
        self.query.visit_mut(&join(prefix, "query"), f);
        self.value.visit_mut(&join(prefix, "value"), f);
    }
}

/// Cache for the head backward pass.
pub struct HeadCache {
    pub batch: usize,
    pub seq_len: usize,
    pub q: Tensor,
    pub k: Tensor,
    pub v: Tensor,
    /// Post-softmax weights, one `[seq_len, seq_len]` matrix per sequence
    pub weights: Vec<Tensor>,
    /// Weights after dropout (equal to `weights` in inference mode)
    pub dropped_weights: Vec<Tensor>,
    pub dropout_caches: Vec<DropoutCache>,
    pub k_cache: LinearCache,
    pub q_cache: LinearCache,
    pub v_cache: LinearCache,
}

/// Gradients for the three bias-free projections.
pub struct HeadGradients {
    pub key: Tensor,
    pub query: Tensor,
    pub value: Tensor,
    pub x: Tensor,
}

impl Visit for HeadGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(&join(prefix, "key"), "weight"), &self.key);
        f(&join(&join(prefix, "query"), "weight"), &self.query);
        f(&join(&join(prefix, "value"), "weight"), &self.value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn head(block_size: usize) -> AttentionHead {
        let mut rng = StdRng::seed_from_u64(3);
        // larger weights than the 0.02 init so the attention pattern is not uniform
        let mut head = AttentionHead::new(4, 2, 0.0, Arc::new(CausalMask::new(block_size)), &mut rng);
        head.visit_mut("", &mut |_, t| *t = t.mul_scalar(50.0));
        head
    }

    #[test]
    fn test_mask_is_lower_triangular() {
        let mask = CausalMask::new(3);
        assert!(mask.allows(0, 0));
        assert!(mask.allows(2, 1));
        assert!(!mask.allows(0, 1));
        assert!(!mask.allows(1, 2));
    }

    #[test]
    fn test_future_positions_get_zero_weight() {
        let head = head(5);
        let mut rng = StdRng::seed_from_u64(11);
        let x = Tensor::randn(vec![2 * 4, 4], 1.0, &mut rng);
        let (out, cache) = head.forward(&x, 2, 4);
        assert_eq!(out.shape, vec![8, 2]);

        for weights in &cache.weights {
            for i in 0..4 {
                let row = &weights.data[i * 4..(i + 1) * 4];
                assert_abs_diff_eq!(row.iter().sum::<f32>(), 1.0, epsilon = 1e-5);
                for (j, &w) in row.iter().enumerate() {
                    if j > i {
                        assert_eq!(w, 0.0, "weight from {} to future {} must be zero", i, j);
                    }
                }
            }
        }
    }

    #[test]
    fn test_outputs_ignore_future_tokens() {
        let head = head(4);
        let mut rng = StdRng::seed_from_u64(5);
        let x = Tensor::randn(vec![4, 4], 1.0, &mut rng);
        let mut changed = x.clone();
        for d in 0..4 {
            changed.data[3 * 4 + d] += 10.0;
        }

        let (a, _) = head.forward(&x, 1, 4);
        let (b, _) = head.forward(&changed, 1, 4);
        assert_eq!(a.data[..3 * 2], b.data[..3 * 2]);
        assert_ne!(a.data[3 * 2..], b.data[3 * 2..]);
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() {
        let head = head(3);
        let mut rng = StdRng::seed_from_u64(9);
        let x = Tensor::randn(vec![3, 4], 0.5, &mut rng);
        let upstream = Tensor::randn(vec![3, 2], 1.0, &mut rng);

        let objective = |x: &Tensor| -> f32 {
            let (y, _) = head.forward(x, 1, 3);
            y.data.iter().zip(&upstream.data).map(|(a, b)| a * b).sum()
        };

        let (_, cache) = head.forward(&x, 1, 3);
        let grads = head.backward(&upstream, &cache);

        let h = 1e-2;
        for i in 0..x.numel() {
            let mut plus = x.clone();
            plus.data[i] += h;
            let mut minus = x.clone();
            minus.data[i] -= h;
            let numeric = (objective(&plus) - objective(&minus)) / (2.0 * h);
            let tolerance = 2e-2 + 0.05 * numeric.abs();
            assert!(
                (grads.x.data[i] - numeric).abs() < tolerance,
                "x[{}]: analytic {} vs numeric {}",
                i,
                grads.x.data[i],
                numeric
            );
        }
    }
}
