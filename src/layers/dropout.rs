//! Dropout Layer
//!
//! Inverted dropout: in training mode each element is zeroed with probability
//! `rate` and survivors are scaled by `1 / (1 - rate)`. In inference mode the
//! layer is the identity, which is what makes evaluation and generation
//! deterministic.

use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
}

impl Dropout {
    /// Create a dropout layer, starting in training mode.
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "Dropout rate must be in [0.0, 1.0)"
        );
        Self {
            rate,
            training: true,
        }
    }

    /// Forward pass; the cache remembers which elements survived.
    pub fn forward(&self, x: &Tensor) -> (Tensor, DropoutCache) {
        if !self.training || self.rate == 0.0 {
            let cache = DropoutCache {
                mask: None,
                scale: 1.0,
            };
            return (x.clone(), cache);
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mut mask = Vec::with_capacity(x.numel());
        let mut output = Tensor::zeros(x.shape.clone());

        for (i, &value) in x.data.iter().enumerate() {
            let keep = rand::random::<f32>() >= self.rate;
            mask.push(keep);
            if keep {
                output.data[i] = value * scale;
            }
        }

        (
            output,
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Route the gradient through the elements that survived.
    pub fn backward(&self, grad_output: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let mut grad_input = Tensor::zeros(grad_output.shape.clone());
                for (i, &keep) in mask.iter().enumerate() {
                    if keep {
                        grad_input.data[i] = grad_output.data[i] * cache.scale;
                    }
                }
                grad_input
            }
            None => grad_output.clone(),
        }
    }
}

/// Cache for the dropout backward pass.
pub struct DropoutCache {
    /// true = kept; `None` when dropout was inactive
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inference_mode_is_identity() {
        let mut dropout = Dropout::new(0.5);
        dropout.training = false;
        let x = Tensor::full(vec![10, 10], 3.0);
        let (y, cache) = dropout.forward(&x);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn test_training_mode_zeroes_and_scales() {
        let dropout = Dropout::new(0.5);
        let x = Tensor::full(vec![100, 100], 1.0);
        let (y, cache) = dropout.forward(&x);

        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = y.data.iter().filter(|&&v| v == 2.0).count();
        assert!(kept > 4000 && kept < 6000, "kept {} of 10000", kept);

        let grad = dropout.backward(&Tensor::full(vec![100, 100], 1.0), &cache);
        assert_eq!(grad, y);
    }
}
