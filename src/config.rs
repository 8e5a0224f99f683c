//! Model and Training Configuration
//!
//! One immutable [`Config`] describes the whole run: model shape, optimizer
//! learning rate, data handling and checkpoint cadence. It is built once at
//! process start (defaults, a JSON file, CLI overrides), validated, and then
//! passed by reference to every component.
//!
//! ## Example
//!
//! ```rust
//! use scribe::Config;
//!
//! let config = Config::tiny(64);
//! config.validate().unwrap();
//! assert_eq!(config.head_size(), 8);
//! ```

use crate::error::{Result, ScribeError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Where the core computation runs.
///
/// Only the CPU backend exists. `Auto` resolves to it; explicitly asking for
/// an accelerator is a fatal resource error rather than a silent fallback.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Auto,
    Cpu,
    Accelerator,
}

impl Device {
    /// Resolve to a concrete device available in this build.
    pub fn resolve(self) -> Result<Device> {
        match self {
            Device::Auto | Device::Cpu => Ok(Device::Cpu),
            Device::Accelerator => Err(ScribeError::DeviceUnavailable(
                "this build has no accelerator backend; use \"cpu\" or \"auto\"".to_string(),
            )),
        }
    }
}

/// Hyperparameters for model construction and training.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Vocabulary size, special tokens included
    pub vocab_size: usize,
    /// Embedding width
    pub n_embd: usize,
    /// Attention heads per block (must divide `n_embd`)
    pub n_head: usize,
    /// Number of transformer blocks
    pub n_layer: usize,
    /// Maximum context length
    pub block_size: usize,
    /// Dropout probability used during training
    pub dropout: f32,

    /// Sequences per batch
    pub batch_size: usize,
    /// AdamW learning rate
    pub learning_rate: f32,
    /// Passes over the training split
    pub epochs: usize,
    /// Write a checkpoint every N iterations
    pub checkpoint_steps: usize,
    /// Maximum batches per split when estimating loss
    pub eval_iters: usize,

    /// End-of-sequence token id
    pub eos_id: usize,
    /// Padding token id
    pub pad_id: usize,
    /// Fraction of the corpus held out for validation
    pub val_fraction: f32,
    /// Seed for the train/validation shuffle
    pub split_seed: u64,
    /// Seed for parameter initialization and batch shuffling
    pub seed: u64,

    pub device: Device,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab_size: 10002,
            n_embd: 64,
            n_head: 8,
            n_layer: 6,
            block_size: 512,
            dropout: 0.2,
            batch_size: 8,
            learning_rate: 3e-4,
            epochs: 200,
            checkpoint_steps: 5000,
            eval_iters: 2000,
            eos_id: 10000,
            pad_id: 10001,
            val_fraction: 0.3,
            split_seed: 42,
            seed: 1337,
            device: Device::Auto,
        }
    }
}

impl Config {
    /// A very small configuration for tests and smoke runs.
    ///
    /// The last two ids of the vocabulary are reserved for end-of-sequence and
    /// padding. Dropout is disabled so forward passes are deterministic.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            n_embd: 16,
            n_head: 2,
            n_layer: 2,
            block_size: 8,
            dropout: 0.0,
            batch_size: 4,
            learning_rate: 1e-3,
            epochs: 1,
            checkpoint_steps: 1000,
            eval_iters: 4,
            eos_id: vocab_size.saturating_sub(2),
            pad_id: vocab_size.saturating_sub(1),
            ..Self::default()
        }
    }

    /// Width of a single attention head.
    pub fn head_size(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Check every invariant the model and trainer rely on.
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("vocab_size", self.vocab_size),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
            ("block_size", self.block_size),
            ("batch_size", self.batch_size),
            ("checkpoint_steps", self.checkpoint_steps),
            ("eval_iters", self.eval_iters),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ScribeError::Config(format!("{} must be greater than 0", name)));
            }
        }

        if self.n_embd % self.n_head != 0 {
            return Err(ScribeError::Config(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ScribeError::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(ScribeError::Config(format!(
                "learning_rate must be a positive number, got {}",
                self.learning_rate
            )));
        }
        if !(0.0..1.0).contains(&self.val_fraction) {
            return Err(ScribeError::Config(format!(
                "val_fraction must be in [0, 1), got {}",
                self.val_fraction
            )));
        }
        for (name, id) in [("eos_id", self.eos_id), ("pad_id", self.pad_id)] {
            if id >= self.vocab_size {
                return Err(ScribeError::Config(format!(
                    "{} ({}) is outside the vocabulary (vocab_size = {})",
                    name, id, self.vocab_size
                )));
            }
        }
        if self.eos_id == self.pad_id {
            return Err(ScribeError::Config(format!(
                "eos_id and pad_id must differ (both are {})",
                self.eos_id
            )));
        }
        Ok(())
    }

    /// Read a JSON config file; missing fields take their default values.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Write the config as pretty-printed JSON.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
