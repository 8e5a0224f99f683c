//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, using the defaults of
//! `torch.optim.AdamW`:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # decoupled weight decay
//! m = β₁ * m + (1 - β₁) * g        # first moment
//! v = β₂ * v + (1 - β₂) * g²       # second moment
//! m_hat = m / (1 - β₁^t)
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! with β₁ = 0.9, β₂ = 0.999, ε = 1e-8 and λ = 0.01 applied to every
//! parameter (embeddings, biases and layer norm included).
//!
//! ## State Layout
//!
//! Moments are stored as one `(m, v)` pair per parameter tensor, in the order
//! the model visits its parameters. Gradients are visited in the same order,
//! so pairing is positional; the names are kept so a checkpoint can store the
//! moments and a reload can verify them.

use crate::error::{Result, ScribeError};
use crate::layers::{Visit, VisitMut};
use crate::model::{LanguageModel, ModelGradients};
use crate::tensor::Tensor;
use rayon::prelude::*;

/// AdamW hyperparameters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct AdamWConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
}

impl AdamWConfig {
    pub fn with_lr(lr: f32) -> Self {
        Self {
            lr,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.01,
        }
    }
}

/// Optimizer state: hyperparameters, step count and both moments.
pub struct AdamW {
    pub config: AdamWConfig,
    pub step: u64,
    pub names: Vec<String>,
    pub m: Vec<Tensor>,
    pub v: Vec<Tensor>,
}

impl AdamW {
    /// Zero moments shaped like every parameter of `model`.
    pub fn new(model: &LanguageModel, lr: f32) -> Self {
        let mut names = Vec::new();
        let mut m = Vec::new();
        model.visit("", &mut |name, t| {
            names.push(name.to_string());
            m.push(Tensor::zeros(t.shape.clone()));
        });
        let v = m.clone();
        Self {
            config: AdamWConfig::with_lr(lr),
            step: 0,
            names,
            m,
            v,
        }
    }

    /// Apply one update to every parameter.
    pub fn step(&mut self, model: &mut LanguageModel, grads: &ModelGradients) {
        self.step += 1;
        let t = self.step as i32;
        let AdamWConfig {
            lr,
            beta1,
            beta2,
            epsilon,
            weight_decay,
        } = self.config;
        let bias_correction1 = 1.0 - beta1.powi(t);
        let bias_correction2 = 1.0 - beta2.powi(t);

        let mut params: Vec<&mut Tensor> = Vec::with_capacity(self.m.len());
        model.visit_mut("", &mut |_, p| params.push(p));
        let mut gradients: Vec<&Tensor> = Vec::with_capacity(self.m.len());
        grads.visit("", &mut |_, g| gradients.push(g));
        assert_eq!(params.len(), gradients.len(), "one gradient per parameter");
        assert_eq!(params.len(), self.m.len(), "optimizer built for a different model");

        params
            .into_par_iter()
            .zip(gradients.into_par_iter())
            .zip(self.m.par_iter_mut().zip(self.v.par_iter_mut()))
            .for_each(|((param, grad), (m, v))| {
                for i in 0..param.data.len() {
                    let g = grad.data[i];
                    param.data[i] *= 1.0 - lr * weight_decay;
                    m.data[i] = beta1 * m.data[i] + (1.0 - beta1) * g;
                    v.data[i] = beta2 * v.data[i] + (1.0 - beta2) * g * g;
                    let m_hat = m.data[i] / bias_correction1;
                    let v_hat = v.data[i] / bias_correction2;
                    param.data[i] -= lr * m_hat / (v_hat.sqrt() + epsilon);
                }
            });
    }

    /// Replace the moments with ones restored from a checkpoint.
    ///
    /// Names and shapes must line up with this optimizer's parameters.
    pub fn restore(
        &mut self,
        step: u64,
        m: Vec<(String, Tensor)>,
        v: Vec<(String, Tensor)>,
    ) -> Result<()> {
        if m.len() != self.m.len() || v.len() != self.v.len() {
            return Err(ScribeError::Checkpoint(format!(
                "optimizer state has {} moments, model has {} parameters",
                m.len(),
                self.m.len()
            )));
        }
        for (i, ((m_name, m_tensor), (v_name, v_tensor))) in m.iter().zip(&v).enumerate() {
            let expected = &self.names[i];
            if m_name != expected || v_name != expected {
                return Err(ScribeError::Checkpoint(format!(
                    "optimizer moment {} is named {}/{}, expected {}",
                    i, m_name, v_name, expected
                )));
            }
            if m_tensor.shape != self.m[i].shape || v_tensor.shape != self.v[i].shape {
                return Err(ScribeError::Checkpoint(format!(
                    "optimizer moment {} has shape {:?}, expected {:?}",
                    expected, m_tensor.shape, self.m[i].shape
                )));
            }
        }
        self.step = step;
        self.m = m.into_iter().map(|(_, t)| t).collect();
        self.v = v.into_iter().map(|(_, t)| t).collect();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use approx::assert_abs_diff_eq;

    fn tiny_model() -> LanguageModel {
        LanguageModel::new(&Config::tiny(12)).unwrap()
    }

    #[test]
    fn test_first_step_moves_each_weight_by_about_lr() {
        let mut model = tiny_model();
        let before = model.lm_head.weight.clone();
        let mut optimizer = AdamW::new(&model, 1e-3);

        let (_, cache) = model
            .forward_train(&[vec![1, 2, 3, 4]], &[vec![2, 3, 4, 5]])
            .unwrap();
        let grads = model.backward(&cache);
        optimizer.step(&mut model, &grads);

        assert_eq!(optimizer.step, 1);
        // with bias correction the first update is lr * sign(g), plus a tiny decay term
        for (i, (&b, &a)) in before.data.iter().zip(&model.lm_head.weight.data).enumerate() {
            let g = grads.lm_head.weight.data[i];
            if g.abs() > 1e-6 {
                let expected = b * (1.0 - 1e-3 * 0.01) - 1e-3 * g.signum();
                assert_abs_diff_eq!(a, expected, epsilon = 1e-5);
            }
        }
    }

    #[test]
    fn test_zero_gradient_applies_only_weight_decay() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(&model, 0.1);
        let (_, cache) = model.forward_train(&[vec![1]], &[vec![2]]).unwrap();
        let mut grads = model.backward(&cache);
        grads.ln_f.gamma = Tensor::zeros(grads.ln_f.gamma.shape.clone());

        optimizer.step(&mut model, &grads);
        for &g in &model.ln_f.gamma.data {
            assert_abs_diff_eq!(g, 1.0 - 0.1 * 0.01, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_repeated_steps_reduce_loss() {
        let mut model = tiny_model();
        let mut optimizer = AdamW::new(&model, 1e-2);
        let inputs = vec![vec![1, 2, 3, 4], vec![5, 6, 7, 8]];
        let targets = vec![vec![2, 3, 4, 5], vec![6, 7, 8, 9]];

        let initial = model.forward(&inputs, Some(targets.as_slice())).unwrap().loss.unwrap();
        for _ in 0..50 {
            let (_, cache) = model.forward_train(&inputs, &targets).unwrap();
            let grads = model.backward(&cache);
            optimizer.step(&mut model, &grads);
        }
        let trained = model.forward(&inputs, Some(targets.as_slice())).unwrap().loss.unwrap();
        assert!(trained < initial * 0.7, "loss {} -> {}", initial, trained);
    }

    #[test]
    fn test_restore_rejects_mismatched_state() {
        let model = tiny_model();
        let mut optimizer = AdamW::new(&model, 1e-3);
        let short = vec![("token_embedding.weight".to_string(), Tensor::zeros(vec![12, 16]))];
        assert!(optimizer.restore(3, short.clone(), short).is_err());

        let mut renamed: Vec<(String, Tensor)> = optimizer
            .names
            .iter()
            .cloned()
            .zip(optimizer.m.iter().cloned())
            .collect();
        renamed[0].0 = "wrong".to_string();
        assert!(optimizer.restore(3, renamed.clone(), renamed).is_err());
        assert_eq!(optimizer.step, 0);
    }
}
