//! Sample token ids from a trained checkpoint.
//!
//! ```bash
//! cargo run --release --bin generate -- \
//!     --checkpoint checkpoints/chkpt_5000.bin --prompt 12,7,431 --max-new-tokens 50
//! ```
//!
//! Prints the prompt followed by the sampled ids, comma-separated. Decoding to
//! text is left to the tokenizer that produced the corpus.

use clap::Parser;
use scribe::{Checkpoint, Generator};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "generate", about = "Sample a continuation from a trained model")]
struct Args {
    /// Checkpoint written by `train`
    #[arg(long)]
    checkpoint: PathBuf,

    /// Comma-separated prompt token ids
    #[arg(long)]
    prompt: String,

    /// Number of ids to sample
    #[arg(long, default_value_t = 100)]
    max_new_tokens: usize,

    /// Random seed for sampling
    #[arg(long, default_value_t = 1337)]
    seed: u64,

    /// Cut the output after the first end-of-sequence id
    #[arg(long)]
    stop_at_eos: bool,
}

fn parse_ids(text: &str) -> Result<Vec<usize>, std::num::ParseIntError> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse)
        .collect()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let checkpoint = Checkpoint::load(&args.checkpoint)?;
    let mut model = checkpoint.model;
    println!(
        "  Model from iteration {} ({} parameters)",
        checkpoint.metadata.iteration,
        model.num_parameters()
    );

    let prompt = parse_ids(&args.prompt)?;
    let mut generator = Generator::new(prompt, args.max_new_tokens, args.seed);
    if args.stop_at_eos {
        generator = generator.with_stop_token(model.config.eos_id);
    }

    let ids = generator.run(&mut model)?;
    let prompt_len = generator.prompt().len();
    let format = |ids: &[usize]| {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",")
    };

    println!("Prompt:    {}", format(&ids[..prompt_len]));
    println!("Generated: {}", format(&ids[prompt_len..]));

    Ok(())
}
