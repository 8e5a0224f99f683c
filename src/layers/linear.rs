//! Linear Layer (Fully Connected)
//!
//! Affine transformation `y = x @ W + b`, or `y = x @ W` for the bias-free
//! query/key/value projections of an attention head.
//!
//! ```text
//! Input:  x [rows, in_features]
//! Weight: W [in_features, out_features]
//! Bias:   b [out_features]          (optional)
//! Output: y [rows, out_features]
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y, axis=0)
//! grad_x = grad_y @ W^T
//! ```
//!
//! Weights are drawn from `N(0, 0.02²)` and biases start at zero.

use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;
use rand::Rng;

/// Standard deviation of every weight matrix and embedding table at init.
pub const INIT_STD: f32 = 0.02;

/// Fully connected layer.
#[derive(Clone, Debug)]
pub struct Linear {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
}

impl Linear {
    /// Create a layer with normal(0, 0.02) weights and, if requested, a zero bias.
    pub fn new<R: Rng + ?Sized>(
        in_features: usize,
        out_features: usize,
        bias: bool,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Tensor::randn(vec![in_features, out_features], INIT_STD, rng),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
        }
    }

    /// Forward pass over `[rows, in_features]`, caching the input.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = self.apply(x);
        (y, LinearCache { x: x.clone() })
    }

    /// Forward pass without a cache, for inference paths.
    pub fn apply(&self, x: &Tensor) -> Tensor {
        let y = x.matmul(&self.weight);
        match &self.bias {
            Some(bias) => y.add(bias),
            None => y,
        }
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        LinearGradients {
            weight: cache.x.transpose().matmul(grad_out),
            bias: self.bias.as_ref().map(|_| grad_out.sum_rows()),
            x: grad_out.matmul(&self.weight.transpose()),
        }
    }
}

impl Visit for Linear {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            f(&join(prefix, "bias"), bias);
        }
    }
}

impl VisitMut for Linear {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        f(&join(prefix, "weight"), &mut self.weight);
        if let Some(bias) = &mut self.bias {
            f(&join(prefix, "bias"), bias);
        }
    }
}

/// Cache for the linear backward pass.
pub struct LinearCache {
    pub x: Tensor,
}

/// Gradients for a linear layer.
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Gradient to pass to the previous layer
    pub x: Tensor,
}

impl Visit for LinearGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "weight"), &self.weight);
        if let Some(bias) = &self.bias {
            f(&join(prefix, "bias"), bias);
        }
    }
}
