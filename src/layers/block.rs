//! Transformer Block
//!
//! Pre-norm residual block:
//!
//! ```text
//! x → LayerNorm → MultiHeadAttention → (+) → LayerNorm → FeedForward → (+) → out
//! │                                     ↑                               ↑
//! └─────────────────────────────────────┘                               │
//!                                       └───────────────────────────────┘
//! ```
//!
//! ## Backward Pass
//!
//! At each residual connection the gradient splits into two paths: straight
//! through the skip connection, and through the sublayer and its layer norm.
//! The two are summed before continuing upstream.

use super::attention::CausalMask;
use super::feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::multi_head::{MultiHeadAttention, MultiHeadCache, MultiHeadGradients};
use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;
use rand::Rng;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub ln1: LayerNorm,
    pub attn: MultiHeadAttention,
    pub ln2: LayerNorm,
    pub ffwd: FeedForward,
}

impl TransformerBlock {
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        n_head: usize,
        dropout: f32,
        mask: Arc<CausalMask>,
        rng: &mut R,
    ) -> Self {
        let attn = MultiHeadAttention::new(n_embd, n_head, dropout, mask, rng);
        let ffwd = FeedForward::new(n_embd, dropout, rng);
        Self {
            ln1: LayerNorm::new(n_embd),
            attn,
            ln2: LayerNorm::new(n_embd),
            ffwd,
        }
    }

    /// `[batch * seq_len, n_embd] -> [batch * seq_len, n_embd]`
    pub fn forward(&self, x: &Tensor, batch: usize, seq_len: usize) -> (Tensor, BlockCache) {
        let (ln1_out, ln1_cache) = self.ln1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward(&ln1_out, batch, seq_len);
        let x_after_attn = x.add(&attn_out);

        let (ln2_out, ln2_cache) = self.ln2.forward(&x_after_attn);
        let (ffwd_out, ffwd_cache) = self.ffwd.forward(&ln2_out);
        let out = x_after_attn.add(&ffwd_out);

        let cache = BlockCache {
            ln1_cache,
            attn_cache,
            ln2_cache,
            ffwd_cache,
        };
        (out, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        // second residual: out = x_after_attn + ffwd(ln2(x_after_attn))
        let ffwd = self.ffwd.backward(grad_out, &cache.ffwd_cache);
        let ln2 = self.ln2.backward(&ffwd.x, &cache.ln2_cache);
        let mut grad_after_attn = grad_out.clone();
        grad_after_attn.add_assign(&ln2.x);

        // first residual: x_after_attn = x + attn(ln1(x))
        let attn = self.attn.backward(&grad_after_attn, &cache.attn_cache);
        let ln1 = self.ln1.backward(&attn.x, &cache.ln1_cache);
        let mut grad_x = grad_after_attn;
        grad_x.add_assign(&ln1.x);

        BlockGradients {
            ln1,
            attn,
            ln2,
            ffwd,
            x: grad_x,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn.set_training(training);
        self.ffwd.set_training(training);
    }
}

impl Visit for TransformerBlock {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.ln1.visit(&join(prefix, "ln1"), f);
        self.attn.visit(&join(prefix, "attn"), f);
        self.ln2.visit(&join(prefix, "ln2"), f);
        self.ffwd.visit(&join(prefix, "ffwd"), f);
    }
}

impl VisitMut for TransformerBlock {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        self.ln1.visit_mut(&join(prefix, "ln1"), f);
        self.attn.visit_mut(&join(prefix, "attn"), f);
        self.ln2.visit_mut(&join(prefix, "ln2"), f);
        self.ffwd.visit_mut(&join(prefix, "ffwd"), f);
    }
}

pub struct BlockCache {
    pub ln1_cache: LayerNormCache,
    pub attn_cache: MultiHeadCache,
    pub ln2_cache: LayerNormCache,
    pub ffwd_cache: FeedForwardCache,
}

pub struct BlockGradients {
    pub ln1: LayerNormGradients,
    pub attn: MultiHeadGradients,
    pub ln2: LayerNormGradients,
    pub ffwd: FeedForwardGradients,
    pub x: Tensor,
}

impl Visit for BlockGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.ln1.visit(&join(prefix, "ln1"), f);
        self.attn.visit(&join(prefix, "attn"), f);
        self.ln2.visit(&join(prefix, "ln2"), f);
        self.ffwd.visit(&join(prefix, "ffwd"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_block_preserves_shape_and_gradient_names_line_up() {
        let mut rng = StdRng::seed_from_u64(4);
        let block = TransformerBlock::new(8, 2, 0.0, Arc::new(CausalMask::new(4)), &mut rng);
        let x = Tensor::randn(vec![2 * 4, 8], 1.0, &mut rng);

        let (out, cache) = block.forward(&x, 2, 4);
        assert_eq!(out.shape, x.shape);

        let grads = block.backward(&Tensor::full(vec![8, 8], 0.1), &cache);
        assert_eq!(grads.x.shape, x.shape);

        let mut params = Vec::new();
        block.visit("blocks.0", &mut |name, t| params.push((name.to_string(), t.shape.clone())));
        let mut grad_entries = Vec::new();
        grads.visit("blocks.0", &mut |name, t| {
            grad_entries.push((name.to_string(), t.shape.clone()))
        });
        assert_eq!(params, grad_entries);
    }

    #[test]
    fn test_zeroed_sublayers_make_block_identity() {
        let mut rng = StdRng::seed_from_u64(6);
        let mut block = TransformerBlock::new(4, 2, 0.0, Arc::new(CausalMask::new(3)), &mut rng);
        block.attn.proj.weight = Tensor::zeros(vec![4, 4]);
        block.ffwd.fc2.weight = Tensor::zeros(vec![16, 4]);

        let x = Tensor::randn(vec![3, 4], 1.0, &mut rng);
        let (out, _) = block.forward(&x, 1, 3);
        assert_eq!(out, x);
    }
}
