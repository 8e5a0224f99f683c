//! Train a language model on a pre-tokenized corpus.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --release --bin train -- \
//!     --config config.json --data corpus.csv --checkpoint-dir checkpoints
//!
//! # Override training knobs from the config file
//! cargo run --release --bin train -- \
//!     --config config.json --data corpus.csv --checkpoint-dir checkpoints \
//!     --epochs 5 --batch-size 16 --lr 0.001 --log training_log.csv --prefetch 4
//! ```
//!
//! The corpus is a `|`-delimited table with an `X` and a `y` column, each
//! cell a JSON array of token ids.

use clap::Parser;
use scribe::{train_val_split, Config, Corpus, Trainer, TrainingLogger};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "train", about = "Train a decoder-only language model")]
struct Args {
    /// Model and training configuration (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Tokenized corpus with X|y columns
    #[arg(long)]
    data: PathBuf,

    /// Directory for chkpt_<iteration>.bin files
    #[arg(long)]
    checkpoint_dir: PathBuf,

    /// Number of passes over the training split
    #[arg(long)]
    epochs: Option<usize>,

    /// Sequences per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// AdamW learning rate
    #[arg(long)]
    lr: Option<f32>,

    /// Write evaluation metrics to this CSV file
    #[arg(long)]
    log: Option<PathBuf>,

    /// Build batches on a background thread, queueing up to N of them
    #[arg(long)]
    prefetch: Option<usize>,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    println!("\n{}", "=".repeat(70));
    println!("  Training Scribe");
    println!("{}", "=".repeat(70));
    println!();

    // ========================================================================
    // 1. Configuration
    // ========================================================================
    println!("{}", "=".repeat(70));
    println!("1. Configuration");
    println!("{}", "=".repeat(70));
    println!();

    let mut config = Config::from_file(&args.config)?;
    if let Some(epochs) = args.epochs {
        config.epochs = epochs;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        config.learning_rate = lr;
    }
    config.validate()?;

    println!("  Vocabulary: {}", config.vocab_size);
    println!("  Embedding: {}", config.n_embd);
    println!("  Layers: {}", config.n_layer);
    println!("  Heads: {} ({}d each)", config.n_head, config.head_size());
    println!("  Context: {}", config.block_size);
    println!("  Dropout: {}", config.dropout);
    println!("  Batch size: {}", config.batch_size);
    println!("  Learning rate: {}", config.learning_rate);
    println!("  Epochs: {}", config.epochs);

    // ========================================================================
    // 2. Data
    // ========================================================================
    println!("\n{}", "=".repeat(70));
    println!("2. Loading Training Data");
    println!("{}", "=".repeat(70));
    println!();

    let corpus = Corpus::load(&args.data, config.block_size, config.vocab_size)?;
    if corpus.skipped > 0 {
        println!("  Skipped {} malformed rows", corpus.skipped);
    }
    let (train, val) = train_val_split(corpus.examples, config.val_fraction, config.split_seed);
    println!(
        "  Train: {} examples, validation: {} examples ({:.0}%)",
        train.len(),
        val.len(),
        config.val_fraction * 100.0
    );

    // ========================================================================
    // 3. Model
    // ========================================================================
    println!("\n{}", "=".repeat(70));
    println!("3. Model");
    println!("{}", "=".repeat(70));
    println!();

    let mut trainer = Trainer::new(config, train, val, &args.checkpoint_dir)?;
    let num_params = trainer.model.num_parameters();
    println!(
        "  Parameters: {} ({:.2}M)",
        num_params,
        num_params as f64 / 1_000_000.0
    );
    let config_copy = args.checkpoint_dir.join("config.json");
    trainer.config().save(&config_copy)?;
    println!("  Config saved to: {}", config_copy.display());

    if let Some(log_path) = &args.log {
        trainer = trainer.with_logger(TrainingLogger::new(log_path)?);
        println!("  Logging to: {}", log_path.display());
    }
    if let Some(capacity) = args.prefetch {
        trainer = trainer.with_prefetch(capacity);
        println!("  Prefetching up to {} batches", capacity);
    }

    // ========================================================================
    // 4. Train
    // ========================================================================
    println!("\n{}", "=".repeat(70));
    println!("4. Training");
    println!("{}", "=".repeat(70));
    println!();

    let report = trainer.run()?;

    println!("\n{}", "=".repeat(70));
    println!("  Done");
    println!("{}", "=".repeat(70));
    println!();
    println!("  Iterations: {}", report.iterations);
    if let Some(loss) = report.last_train_loss {
        println!("  Last training loss: {:.4}", loss);
    }
    if let Some(last) = report.evaluations.last() {
        println!(
            "  Last evaluation (step {}): train {:.4}, val {:.4}",
            last.iteration, last.train_loss, last.val_loss
        );
    }
    println!("  Checkpoints written: {}", report.checkpoints.len());
    if report.checkpoint_failures > 0 {
        println!("  Checkpoint failures: {}", report.checkpoint_failures);
    }
    println!("\nTraining complete. Output: {}/", args.checkpoint_dir.display());

    Ok(())
}
