//! Embedding Layer
//!
//! A learned lookup table: row `i` of the weight matrix is the vector for
//! index `i`. Used for both token ids and positions. The backward pass
//! scatter-adds each output gradient row into the row it was read from, so a
//! token appearing twice in a batch receives both contributions.

use super::{join, Visit, VisitMut, INIT_STD};
use crate::tensor::Tensor;
use rand::Rng;

#[derive(Clone, Debug)]
pub struct Embedding {
    /// `[num_embeddings, n_embd]`
    pub weight: Tensor,
}

impl Embedding {
    pub fn new<R: Rng + ?Sized>(num_embeddings: usize, n_embd: usize, rng: &mut R) -> Self {
        Self {
            weight: Tensor::randn(vec![num_embeddings, n_embd], INIT_STD, rng),
        }
    }

    pub fn num_embeddings(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn n_embd(&self) -> usize {
        self.weight.shape[1]
    }

    /// Gather rows: `[len(indices), n_embd]`.
    ///
    /// # Panics
    ///
    /// Panics on an out-of-range index; callers validate ids first.
    pub fn forward(&self, indices: &[usize]) -> Tensor {
        let n_embd = self.n_embd();
        let mut output = Vec::with_capacity(indices.len() * n_embd);
        for &index in indices {
            assert!(
                index < self.num_embeddings(),
                "index {} out of range ({} embeddings)",
                index,
                self.num_embeddings()
            );
            output.extend_from_slice(&self.weight.data[index * n_embd..(index + 1) * n_embd]);
        }
        Tensor::new(output, vec![indices.len(), n_embd])
    }

    /// Scatter-add `grad_out` rows back into a table-shaped gradient.
    pub fn backward(&self, grad_out: &Tensor, indices: &[usize]) -> EmbeddingGradients {
        let n_embd = self.n_embd();
        let mut grad = Tensor::zeros(self.weight.shape.clone());
        for (row, &index) in indices.iter().enumerate() {
            let src = &grad_out.data[row * n_embd..(row + 1) * n_embd];
            let dst = &mut grad.data[index * n_embd..(index + 1) * n_embd];
            for (d, &s) in dst.iter_mut().zip(src) {
                *d += s;
            }
        }
        EmbeddingGradients { weight: grad }
    }
}

impl Visit for Embedding {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "weight"), &self.weight);
    }
}

impl VisitMut for Embedding {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        f(&join(prefix, "weight"), &mut self.weight);
    }
}

pub struct EmbeddingGradients {
    pub weight: Tensor,
}

impl Visit for EmbeddingGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        f(&join(prefix, "weight"), &self.weight);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_and_scatter() {
        let table = Embedding {
            weight: Tensor::new(vec![0.0, 1.0, 10.0, 11.0, 20.0, 21.0], vec![3, 2]),
        };
        let out = table.forward(&[2, 0, 2]);
        assert_eq!(out.data, vec![20.0, 21.0, 0.0, 1.0, 20.0, 21.0]);

        let grads = table.backward(&Tensor::full(vec![3, 2], 1.0), &[2, 0, 2]);
        assert_eq!(grads.weight.data, vec![1.0, 1.0, 0.0, 0.0, 2.0, 2.0]);
    }
}
