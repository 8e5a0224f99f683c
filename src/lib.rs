//! Scribe: A Decoder-Only Causal Language Model
//!
//! A small transformer language model over pre-tokenized id sequences, with
//! hand-written forward and backward passes, trained and sampled on the CPU.
//!
//! # Modules
//!
//! - [`config`] - Hyperparameters, loaded from JSON
//! - [`tensor`] - Row-major `f32` tensors and their kernels
//! - [`layers`] - Attention heads, feed-forward, layer norm and friends
//! - [`model`] - The full language model, loss and sampling
//! - [`optimizer`] - AdamW
//! - [`data`] - Corpus parsing, train/val split, batching and prefetch
//! - [`train`] - The training loop with periodic evaluation and checkpoints
//! - [`checkpoint`] - Versioned binary snapshots of weights and optimizer state
//! - [`generate`] - Seeded autoregressive sampling
//! - [`tokenizer`] - The contract an external tokenizer has to meet
//! - [`training_logger`] - CSV metrics log
//!
//! # Example
//!
//! ```rust,no_run
//! use scribe::{train_val_split, Config, Corpus, Trainer};
//!
//! let config = Config::from_file("config.json")?;
//! let corpus = Corpus::load("corpus.csv", config.block_size, config.vocab_size)?;
//! let (train, val) = train_val_split(corpus.examples, config.val_fraction, config.split_seed);
//!
//! let mut trainer = Trainer::new(config, train, val, "checkpoints")?;
//! let report = trainer.run()?;
//! println!("{} iterations", report.iterations);
//! # Ok::<(), scribe::ScribeError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::{Checkpoint, CheckpointMetadata};
pub use config::{Config, Device};
pub use data::{collate, train_val_split, Batch, Corpus, DataLoader, Example, Prefetcher};
pub use error::{Result, ScribeError};
pub use generate::Generator;
pub use model::{ForwardOutput, LanguageModel};
pub use optimizer::{AdamW, AdamWConfig};
pub use tensor::Tensor;
pub use tokenizer::{SpecialTokens, Tokenizer};
pub use train::{eval_interval, Evaluation, Phase, Trainer, TrainingReport};
pub use training_logger::TrainingLogger;
