//! Language Model
//!
//! A decoder-only causal transformer:
//!
//! ```text
//! token ids [B, T]
//!   → token embedding + position embedding (positions 0..T)   [B*T, C]
//!   → TransformerBlock × n_layer                               [B*T, C]
//!   → final LayerNorm                                          [B*T, C]
//!   → lm_head (biased linear)                                  [B*T, V]
//! ```
//!
//! Activations are kept as 2D matrices with the `B` sequences stacked row by
//! row; only attention needs to know where one sequence ends and the next
//! begins. [`LanguageModel::forward`] reshapes the logits to `[B, T, V]` when
//! no targets are given, matching the usual language-model contract.
//!
//! ## Loss
//!
//! Mean cross-entropy over all `B*T` positions. Padding positions are not
//! masked: the padding id is predicted like any other class.
//!
//! ## Initialization
//!
//! Every parameter is drawn from one `StdRng` seeded with `config.seed`, in a
//! fixed order (token embedding, position embedding, blocks, final norm,
//! head). Two models built from the same config are bit-identical.

use crate::config::Config;
use crate::error::{Result, ScribeError};
use crate::layers::{
    join, BlockCache, BlockGradients, CausalMask, Embedding, EmbeddingGradients, LayerNorm,
    LayerNormCache, LayerNormGradients, Linear, LinearCache, LinearGradients, TransformerBlock,
    Visit, VisitMut,
};
use crate::tensor::{softmax_in_place, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{weighted::WeightedIndex, Distribution};
use rayon::prelude::*;
use std::sync::Arc;

/// Result of [`LanguageModel::forward`].
#[derive(Debug)]
pub struct ForwardOutput {
    /// `[B, T, V]` without targets, `[B*T, V]` with targets
    pub logits: Tensor,
    /// Mean cross-entropy, present when targets were given
    pub loss: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct LanguageModel {
    pub config: Config,
    pub token_embedding: Embedding,
    pub position_embedding: Embedding,
    pub blocks: Vec<TransformerBlock>,
    pub ln_f: LayerNorm,
    pub lm_head: Linear,
    training: bool,
}

impl LanguageModel {
    /// Build a freshly initialized model in training mode.
    ///
    /// Fails if the configuration is inconsistent or names a device this
    /// build cannot run on.
    pub fn new(config: &Config) -> Result<Self> {
        config.validate()?;
        config.device.resolve()?;

        let mut rng = StdRng::seed_from_u64(config.seed);
        let mask = Arc::new(CausalMask::new(config.block_size));

        let token_embedding = Embedding::new(config.vocab_size, config.n_embd, &mut rng);
        let position_embedding = Embedding::new(config.block_size, config.n_embd, &mut rng);
        let blocks = (0..config.n_layer)
            .map(|_| {
                TransformerBlock::new(
                    config.n_embd,
                    config.n_head,
                    config.dropout,
                    Arc::clone(&mask),
                    &mut rng,
                )
            })
            .collect();
        let ln_f = LayerNorm::new(config.n_embd);
        let lm_head = Linear::new(config.n_embd, config.vocab_size, true, &mut rng);

        Ok(Self {
            config: config.clone(),
            token_embedding,
            position_embedding,
            blocks,
            ln_f,
            lm_head,
            training: true,
        })
    }

    /// Run the model, computing the loss when `targets` is given.
    pub fn forward(
        &self,
        token_ids: &[Vec<usize>],
        targets: Option<&[Vec<usize>]>,
    ) -> Result<ForwardOutput> {
        let (batch, seq_len) = self.check_batch(token_ids, true)?;
        let vocab_size = self.config.vocab_size;

        match targets {
            Some(targets) => {
                let flat_targets = self.check_targets(targets, batch, seq_len)?;
                let (logits, _) = self.run(token_ids, batch, seq_len);
                let (loss, _) = cross_entropy(&logits, &flat_targets);
                Ok(ForwardOutput {
                    logits,
                    loss: Some(loss),
                })
            }
            None => {
                let (logits, _) = self.run(token_ids, batch, seq_len);
                Ok(ForwardOutput {
                    logits: logits.reshape(&[batch, seq_len, vocab_size]),
                    loss: None,
                })
            }
        }
    }

    /// Forward pass returning the loss and everything [`backward`](Self::backward) needs.
    pub fn forward_train(
        &self,
        token_ids: &[Vec<usize>],
        targets: &[Vec<usize>],
    ) -> Result<(f32, ModelCache)> {
        let (batch, seq_len) = self.check_batch(token_ids, true)?;
        let flat_targets = self.check_targets(targets, batch, seq_len)?;

        let (logits, mut cache) = self.run(token_ids, batch, seq_len);
        let (loss, probs) = cross_entropy(&logits, &flat_targets);
        cache.probs = probs;
        cache.targets = flat_targets;
        Ok((loss, cache))
    }

    /// Backpropagate the mean cross-entropy of a [`forward_train`](Self::forward_train) call.
    pub fn backward(&self, cache: &ModelCache) -> ModelGradients {
        let n = cache.targets.len() as f32;
        let vocab_size = self.config.vocab_size;

        // d(loss)/d(logits) = (softmax - one_hot) / N
        let mut grad_logits = cache.probs.clone();
        grad_logits
            .data
            .par_chunks_mut(vocab_size)
            .zip(cache.targets.par_iter())
            .for_each(|(row, &target)| {
                row[target] -= 1.0;
                for v in row.iter_mut() {
                    *v /= n;
                }
            });

        let lm_head = self.lm_head.backward(&grad_logits, &cache.lm_head_cache);
        let ln_f = self.ln_f.backward(&lm_head.x, &cache.ln_f_cache);

        let mut grad = ln_f.x.clone();
        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.block_caches).rev() {
            let grads = block.backward(&grad, block_cache);
            grad = grads.x.clone();
            blocks.push(grads);
        }
        blocks.reverse();

        let token_embedding = self.token_embedding.backward(&grad, &cache.token_ids);
        let position_embedding = self.position_embedding.backward(&grad, &cache.positions);

        ModelGradients {
            token_embedding,
            position_embedding,
            blocks,
            ln_f,
            lm_head,
        }
    }

    /// Extend every row by `max_new_tokens` sampled ids.
    ///
    /// Each step looks at the last `block_size` tokens only. Sampling draws
    /// from the full softmax distribution, so results depend on `rng`.
    pub fn generate<R: Rng + ?Sized>(
        &self,
        token_ids: &[Vec<usize>],
        max_new_tokens: usize,
        rng: &mut R,
    ) -> Result<Vec<Vec<usize>>> {
        self.check_batch(token_ids, false)?;
        let block_size = self.config.block_size;
        let vocab_size = self.config.vocab_size;

        let mut sequences = token_ids.to_vec();
        for _ in 0..max_new_tokens {
            let context: Vec<Vec<usize>> = sequences
                .iter()
                .map(|s| s[s.len().saturating_sub(block_size)..].to_vec())
                .collect();
            let batch = context.len();
            let seq_len = context[0].len();
            let (logits, _) = self.run(&context, batch, seq_len);

            for (b, sequence) in sequences.iter_mut().enumerate() {
                let last = (b * seq_len + seq_len - 1) * vocab_size;
                let mut probs = logits.data[last..last + vocab_size].to_vec();
                softmax_in_place(&mut probs);
                let dist = WeightedIndex::new(&probs).map_err(|e| {
                    ScribeError::Input(format!("cannot sample next token: {}", e))
                })?;
                sequence.push(dist.sample(rng));
            }
        }
        Ok(sequences)
    }

    /// Toggle dropout for every layer.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for block in &mut self.blocks {
            block.set_training(training);
        }
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Parameter names and shapes, in visiting order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();
        self.visit("", &mut |name, t| shapes.push((name.to_string(), t.shape.clone())));
        shapes
    }

    /// Copies of every parameter, in visiting order.
    pub fn named_parameters(&self) -> Vec<(String, Tensor)> {
        let mut params = Vec::new();
        self.visit("", &mut |name, t| params.push((name.to_string(), t.clone())));
        params
    }

    pub fn num_parameters(&self) -> usize {
        let mut count = 0;
        self.visit("", &mut |_, t| count += t.numel());
        count
    }

    /// Shared forward computation over validated input.
    fn run(&self, token_ids: &[Vec<usize>], batch: usize, seq_len: usize) -> (Tensor, ModelCache) {
        let flat_ids: Vec<usize> = token_ids.iter().flatten().copied().collect();
        let positions: Vec<usize> = (0..batch).flat_map(|_| 0..seq_len).collect();

        let tok = self.token_embedding.forward(&flat_ids);
        let pos = self.position_embedding.forward(&positions);
        let mut x = tok.add(&pos);

        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (out, cache) = block.forward(&x, batch, seq_len);
            x = out;
            block_caches.push(cache);
        }

        let (x, ln_f_cache) = self.ln_f.forward(&x);
        let (logits, lm_head_cache) = self.lm_head.forward(&x);

        let cache = ModelCache {
            token_ids: flat_ids,
            positions,
            block_caches,
            ln_f_cache,
            lm_head_cache,
            probs: Tensor::zeros(vec![0]),
            targets: Vec::new(),
        };
        (logits, cache)
    }

    /// Validate a batch and return `(B, T)`.
    ///
    /// `limit_to_block` is off for generation, which crops long prompts itself.
    fn check_batch(&self, token_ids: &[Vec<usize>], limit_to_block: bool) -> Result<(usize, usize)> {
        let first = token_ids
            .first()
            .ok_or_else(|| ScribeError::Input("empty batch".to_string()))?;
        let seq_len = first.len();
        if seq_len == 0 {
            return Err(ScribeError::Input("sequences must not be empty".to_string()));
        }
        if limit_to_block && seq_len > self.config.block_size {
            return Err(ScribeError::Input(format!(
                "sequence length {} exceeds block size {}",
                seq_len, self.config.block_size
            )));
        }
        for (row, ids) in token_ids.iter().enumerate() {
            if ids.len() != seq_len {
                return Err(ScribeError::Input(format!(
                    "row {} has length {}, expected {}",
                    row,
                    ids.len(),
                    seq_len
                )));
            }
            self.check_ids(ids, row)?;
        }
        Ok((token_ids.len(), seq_len))
    }

    fn check_targets(&self, targets: &[Vec<usize>], batch: usize, seq_len: usize) -> Result<Vec<usize>> {
        if targets.len() != batch || targets.iter().any(|row| row.len() != seq_len) {
            return Err(ScribeError::Input(format!(
                "targets must have shape ({}, {})",
                batch, seq_len
            )));
        }
        for (row, ids) in targets.iter().enumerate() {
            self.check_ids(ids, row)?;
        }
        Ok(targets.iter().flatten().copied().collect())
    }

    fn check_ids(&self, ids: &[usize], row: usize) -> Result<()> {
        match ids.iter().find(|&&id| id >= self.config.vocab_size) {
            Some(id) => Err(ScribeError::Input(format!(
                "token id {} in row {} is outside the vocabulary of {}",
                id, row, self.config.vocab_size
            ))),
            None => Ok(()),
        }
    }
}

impl Visit for LanguageModel {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.token_embedding.visit(&join(prefix, "token_embedding"), f);
        self.position_embedding.visit(&join(prefix, "position_embedding"), f);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&join(prefix, &format!("blocks.{}", i)), f);
        }
        self.ln_f.visit(&join(prefix, "ln_f"), f);
        self.lm_head.visit(&join(prefix, "lm_head"), f);
    }
}

impl VisitMut for LanguageModel {
    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(&str, &'a mut Tensor)) {
        self.token_embedding.visit_mut(&join(prefix, "token_embedding"), f);
        self.position_embedding.visit_mut(&join(prefix, "position_embedding"), f);
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_mut(&join(prefix, &format!("blocks.{}", i)), f);
        }
        self.ln_f.visit_mut(&join(prefix, "ln_f"), f);
        self.lm_head.visit_mut(&join(prefix, "lm_head"), f);
    }
}

/// Mean cross-entropy of `[N, V]` logits against `N` targets.
///
/// Returns the loss and the row-wise softmax, which the backward pass reuses.
pub fn cross_entropy(logits: &Tensor, targets: &[usize]) -> (f32, Tensor) {
    let vocab_size = logits.cols();
    assert_eq!(logits.rows(), targets.len(), "one target per logits row");

    let mut probs = logits.clone();
    let losses: Vec<f32> = probs
        .data
        .par_chunks_mut(vocab_size)
        .zip(targets.par_iter())
        .map(|(row, &target)| {
            let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let sum: f32 = row.iter().map(|&v| (v - max).exp()).sum();
            // (max - x_t) and ln(sum) are both non-negative
            let loss = (max - row[target]) + sum.ln();
            for v in row.iter_mut() {
                *v = (*v - max).exp() / sum;
            }
            loss
        })
        .collect();

    let loss = losses.iter().sum::<f32>() / targets.len() as f32;
    (loss, probs)
}

/// Everything the backward pass needs from one training forward pass.
pub struct ModelCache {
    pub token_ids: Vec<usize>,
    pub positions: Vec<usize>,
    pub block_caches: Vec<BlockCache>,
    pub ln_f_cache: LayerNormCache,
    pub lm_head_cache: LinearCache,
    pub probs: Tensor,
    pub targets: Vec<usize>,
}

/// Gradients for every parameter, visited in the same order as the model.
pub struct ModelGradients {
    pub token_embedding: EmbeddingGradients,
    pub position_embedding: EmbeddingGradients,
    pub blocks: Vec<BlockGradients>,
    pub ln_f: LayerNormGradients,
    pub lm_head: LinearGradients,
}

impl Visit for ModelGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(&str, &'a Tensor)) {
        self.token_embedding.visit(&join(prefix, "token_embedding"), f);
        self.position_embedding.visit(&join(prefix, "position_embedding"), f);
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&join(prefix, &format!("blocks.{}", i)), f);
        }
        self.ln_f.visit(&join(prefix, "ln_f"), f);
        self.lm_head.visit(&join(prefix, "lm_head"), f);
    }
}
