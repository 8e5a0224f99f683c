//! Layer Normalization
//!
//! Normalizes each row to zero mean and unit variance, then applies a learned
//! scale (gamma) and shift (beta):
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / √(var + ε)
//! y      = γ * x_norm + β
//! ```
//!
//! ## Backward Pass
//!
//! ```text
//! grad_γ = sum(grad_y * x_norm)
//! grad_β = sum(grad_y)
//! grad_x = (g - mean(g) - x_norm * mean(g * x_norm)) / √(var + ε),  g = grad_y * γ
//! ```
//!
//! The two mean terms account for every element of a row influencing the
//! row's mean and variance.

use super::{join, Visit, VisitMut};
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct LayerNorm {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    /// Gamma starts at 1, beta at 0, ε = 1e-5.
    pub fn new(n_embd: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![n_embd], 1.0),
            beta: Tensor::zeros(vec![n_embd]),
            eps: 1e-5,
        }
    }

    /// Forward pass over `[rows, n_embd]`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n_embd = self.gamma.numel();
        let rows = x.rows();

        let mut x_norm = Vec::with_capacity(x.numel());
        let mut std = Vec::with_capacity(rows);
        for row in x.data.chunks(n_embd) {
            let mean = row.iter().sum::<f32>() / n_embd as f32;
            let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n_embd as f32;
            let s = (var + self.eps).sqrt();
            x_norm.extend(row.iter().map(|&v| (v - mean) / s));
            std.push(s);
        }

        let mut y = x_norm.clone();
        for row in y.chunks_mut(n_embd) {
            for ((v, &g), &b) in row.iter_mut().zip(&self.gamma.data).zip(&self.beta.data) {
                *v = *v * g + b;
            }
        }

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            std,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n_embd = self.gamma.numel();
        let n = n_embd as f32;

        let mut grad_gamma = vec![0.0; n_embd];
        let mut grad_beta = vec![0.0; n_embd];
        let mut grad_x = Vec::with_capacity(grad_out.numel());

        for ((grad_row, x_norm_row), &std) in grad_out
            .data
            .chunks(n_embd)
            .zip(cache.x_norm.data.chunks(n_embd))
            .zip(&cache.std)
        {
            let mut mean_g = 0.0;
            let mut mean_gx = 0.0;
            for j in 0..n_embd {
                grad_gamma[j] += grad_row[j] * x_norm_row[j];
                grad_beta[j] += grad_row[j];
                let g = grad_row[j] * self.gamma.data[j];
                mean_g += g;
                mean_gx += g * x_norm_row[j];
            }
            mean_g /= n;
            mean_gx /= n;

            for j in 0..n_embd {
                let g = grad_row[j] * self.gamma.data[j];
                grad_x.push((g - mean_g - x_norm_row[j] * mean_gx) / std);
            }
        }

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n_embd]),
            beta: Tensor::new(grad_beta, vec![n_embd]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

impl Visit for LayerNorm {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "gamma"), &self.gamma);
        f(&join(prefix, "beta"), &self.beta);
    }
}

impl VisitMut for LayerNorm {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        f(&join(prefix, "gamma"), &mut self.gamma);
        f(&join(prefix, "beta"), &mut self.beta);
    }
}

/// Cache for the layer norm backward pass.
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// Per-row √(var + ε)
    pub std: Vec<f32>,
}

pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}

impl Visit for LayerNormGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "gamma"), &self.gamma);
        f(&join(prefix, "beta"), &self.beta);
    }
}
