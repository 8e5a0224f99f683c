//! Position-wise Feed-Forward Network
//!
//! ```text
//! h   = ReLU(x @ W1 + b1)       [rows, 4 * n_embd]
//! out = dropout(h @ W2 + b2)    [rows, n_embd]
//! ```
//!
//! Applied to every row independently; positions never interact here.

use super::activation::{relu_backward, relu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc1: Linear,
    pub fc2: Linear,
    pub dropout: Dropout,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(n_embd: usize, dropout: f32, rng: &mut R) -> Self {
        let hidden = 4 * n_embd;
        Self {
            fc1: Linear::new(n_embd, hidden, true, rng),
            fc2: Linear::new(hidden, n_embd, true, rng),
            dropout: Dropout::new(dropout),
        }
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (h, fc1_cache) = self.fc1.forward(x);
        let activated = relu_forward(&h);
        let (y, fc2_cache) = self.fc2.forward(&activated);
        let (out, dropout_cache) = self.dropout.forward(&y);

        let cache = FeedForwardCache {
            fc1_cache,
            h,
            fc2_cache,
            dropout_cache,
        };
        (out, cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let grad_y = self.dropout.backward(grad_out, &cache.dropout_cache);
        let fc2 = self.fc2.backward(&grad_y, &cache.fc2_cache);
        let grad_h = relu_backward(&fc2.x, &cache.h);
        let fc1 = self.fc1.backward(&grad_h, &cache.fc1_cache);
        let x = fc1.x.clone();
        FeedForwardGradients { fc1, fc2, x }
    }

    pub fn set_training(&mut self, training: bool) {
        self.dropout.training = training;
    }
}

impl Visit for FeedForward {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.fc1.visit(&join(prefix, "fc1"), f);
        self.fc2.visit(&join(prefix, "fc2"), f);
    }
}

impl VisitMut for FeedForward {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        self.fc1.visit_mut(&join(prefix, "fc1"), f);
        self.fc2.visit_mut(&join(prefix, "fc2"), f);
    }
}

pub struct FeedForwardCache {
    pub fc1_cache: LinearCache,
    /// Pre-activation hidden layer
    pub h: Tensor,
    pub fc2_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

pub struct FeedForwardGradients {
    pub fc1: LinearGradients,
    pub fc2: LinearGradients,
    pub x: Tensor,
}

impl Visit for FeedForwardGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.fc1.visit(&join(prefix, "fc1"), f);
        self.fc2.visit(&join(prefix, "fc2"), f);
    }
}
