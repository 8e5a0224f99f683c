//! Multi-Head Attention
//!
//! Runs `n_head` independent [`AttentionHead`]s on the same input,
//! concatenates their outputs along the feature axis, then applies an output
//! projection and dropout:
//!
//! ```text
//! heads = [h_0(x), h_1(x), ..., h_{n-1}(x)]     each [rows, head_size]
//! out   = dropout(concat(heads) @ W_proj + b_proj)
//! ```
//!
//! Heads are evaluated in parallel. Concatenation order is head order, so
//! columns `[i * head_size, (i + 1) * head_size)` of the concatenation belong
//! to head `i`.

use super::attention::{AttentionHead, CausalMask, HeadCache, HeadGradients};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;
use rand::Rng;
use rayon::prelude::*;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct MultiHeadAttention {
    pub heads: Vec<AttentionHead>,
    pub proj: Linear,
    pub dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new<R: Rng + ?Sized>(
        n_embd: usize,
        n_head: usize,
        dropout: f32,
        mask: Arc<CausalMask>,
        rng: &mut R,
    ) -> Self {
        let head_size = n_embd / n_head;
        let heads = (0..n_head)
            .map(|_| AttentionHead::new(n_embd, head_size, dropout, Arc::clone(&mask), rng))
            .collect();
        Self {
            heads,
            proj: Linear::new(n_embd, n_embd, true, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn forward(&self, x: &Tensor, batch: usize, seq_len: usize) -> (Tensor, MultiHeadCache) {
        let (outputs, head_caches): (Vec<Tensor>, Vec<HeadCache>) = self
            .heads
            .par_iter()
            .map(|head| head.forward(x, batch, seq_len))
            .unzip();

        let concat = Tensor::concat_cols(&outputs);
        let (projected, proj_cache) = self.proj.forward(&concat);
        let (out, dropout_cache) = self.dropout.forward(&projected);

        let cache = MultiHeadCache {
            head_caches,
            proj_cache,
            dropout_cache,
        };
        (out, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &MultiHeadCache) -> MultiHeadGradients {
        let grad_projected = self.dropout.backward(grad_out, &cache.dropout_cache);
        let proj = self.proj.backward(&grad_projected, &cache.proj_cache);

        let head_size = proj.x.cols() / self.heads.len();
        let grad_heads = proj.x.split_cols(head_size);

        let heads: Vec<HeadGradients> = self
            .heads
            .par_iter()
            .zip(grad_heads.par_iter())
            .zip(cache.head_caches.par_iter())
            .map(|((head, grad), head_cache)| head.backward(grad, head_cache))
            .collect();

        let mut grad_x = Tensor::zeros(heads[0].x.shape.clone());
        for head in &heads {
            grad_x.add_assign(&head.x);
        }

        MultiHeadGradients {
            heads,
            proj,
            x: grad_x,
        }
    }

    pub fn set_training(&mut self, training: bool) {
        for head in &mut self.heads {
            head.set_training(training);
        }
        self.dropout.training = training;
    }
}

impl Visit for MultiHeadAttention {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        for (i, head) in self.heads.iter().enumerate() {
            head.visit(&join(prefix, &format!("heads.{}", i)), f);
        }
        self.proj.visit(&join(prefix, "proj"), f);
    }
}

impl VisitMut for MultiHeadAttention {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        for (i, head) in self.heads.iter_mut().enumerate() {
            head.visit_mut(&join(prefix, &format!("heads.{}", i)), f);
        }
        self.proj.visit_mut(&join(prefix, "proj"), f);
    }
}

pub struct MultiHeadCache {
    pub head_caches: Vec<HeadCache>,
    pub proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

pub struct MultiHeadGradients {
    pub heads: Vec<HeadGradients>,
    pub proj: LinearGradients,
    pub x: Tensor,
}

impl Visit for MultiHeadGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        for (i, head) in self.heads.iter().enumerate() {
            head.visit(&join(prefix, &format!("heads.{}", i)), f);
        }
        self.proj.visit(&join(prefix, "proj"), f);
    }
}
