//! Activation Functions
//!
//! The feed-forward network uses the rectified linear unit:
//!
//! ```text
//! ReLU(x)  = max(0, x)
//! ReLU'(x) = 1 if x > 0 else 0
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

/// ReLU activation (forward pass).
pub fn relu_forward(x: &Tensor) -> Tensor {
    let result = x.data.par_iter().map(|&v| v.max(0.0)).collect();
    Tensor::new(result, x.shape.clone())
}

/// ReLU derivative: passes `grad_out` where the pre-activation `x` was positive.
pub fn relu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let result = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&x_val, &grad)| if x_val > 0.0 { grad } else { 0.0 })
        .collect();
    Tensor::new(result, x.shape.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relu() {
        let x = Tensor::new(vec![-2.0, -0.0, 0.5, 3.0], vec![4]);
        assert_eq!(relu_forward(&x).data, vec![0.0, 0.0, 0.5, 3.0]);

        let grad = relu_backward(&Tensor::full(vec![4], 2.0), &x);
        assert_eq!(grad.data, vec![0.0, 0.0, 2.0, 2.0]);
    }
}
