//! Training Data
//!
//! Loads pre-tokenized examples and turns them into padded batches.
//!
//! ## Corpus Format
//!
//! A `|`-delimited table with a header row naming an `X` (input ids) and a
//! `y` (target ids) column. Every cell holds a JSON array of token ids:
//!
//! ```text
//! X|y
//! [5, 17, 42]|[17, 42, 10000]
//! [8, 3]|[3, 10000]
//! ```
//!
//! Rows that cannot be parsed are skipped with a warning and counted in
//! [`Corpus::skipped`]; a corpus with no usable rows is an error. Examples
//! longer than the block size are truncated to it.
//!
//! ## Batching
//!
//! ```text
//! Corpus → train_val_split → DataLoader (shuffle, collate, pad) → Batch
//!                                   └─ optionally through a Prefetcher thread
//! ```
//!
//! [`collate`] pads every row of a batch to the longest row with the padding
//! id, batch-first.

use crate::error::{Result, ScribeError};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::fs;
use std::path::Path;
use std::sync::mpsc::{sync_channel, Receiver};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// One training example: input ids and the next-token targets.
#[derive(Clone, Debug, PartialEq)]
pub struct Example {
    pub input: Vec<usize>,
    pub target: Vec<usize>,
}

/// A padded batch, `[batch, seq_len]` for both inputs and targets.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub inputs: Vec<Vec<usize>>,
    pub targets: Vec<Vec<usize>>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn seq_len(&self) -> usize {
        self.inputs.first().map_or(0, Vec::len)
    }
}

/// All usable examples of a corpus file.
#[derive(Debug)]
pub struct Corpus {
    pub examples: Vec<Example>,
    /// Rows skipped because they could not be parsed
    pub skipped: usize,
}

impl Corpus {
    /// Read a corpus file, truncating examples to `block_size` ids.
    ///
    /// Rows holding an id outside `0..vocab_size` are skipped like any other
    /// malformed row.
    pub fn load<P: AsRef<Path>>(path: P, block_size: usize, vocab_size: usize) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        let corpus = Self::parse(&text, block_size, vocab_size, &path.display().to_string())?;
        println!(
            "Loaded {} examples from {} ({} skipped)",
            corpus.examples.len(),
            path.display(),
            corpus.skipped
        );
        Ok(corpus)
    }

    /// Parse corpus text; `source` names the input in messages.
    pub fn parse(text: &str, block_size: usize, vocab_size: usize, source: &str) -> Result<Self> {
        let mut lines = text.lines().enumerate();
        let (x_col, y_col) = match lines.next() {
            Some((_, header)) => parse_header(header)?,
            None => return Err(ScribeError::EmptyCorpus(source.to_string())),
        };

        let mut examples = Vec::new();
        let mut skipped = 0;
        for (index, line) in lines {
            if line.trim().is_empty() {
                continue;
            }
            match parse_row(line, index + 1, x_col, y_col, vocab_size) {
                Ok(mut example) => {
                    example.input.truncate(block_size);
                    example.target.truncate(block_size);
                    examples.push(example);
                }
                Err(e) => {
                    eprintln!("⚠️  skipping row: {}", e);
                    skipped += 1;
                }
            }
        }

        if examples.is_empty() {
            return Err(ScribeError::EmptyCorpus(source.to_string()));
        }
        Ok(Self { examples, skipped })
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

fn parse_header(header: &str) -> Result<(usize, usize)> {
    let columns: Vec<&str> = header.split('|').map(str::trim).collect();
    let find = |name: &str| {
        columns.iter().position(|&c| c == name).ok_or_else(|| ScribeError::Data {
            line: 1,
            reason: format!("header has no {} column", name),
        })
    };
    Ok((find("X")?, find("y")?))
}

fn parse_row(
    line: &str,
    line_number: usize,
    x_col: usize,
    y_col: usize,
    vocab_size: usize,
) -> Result<Example> {
    let cells: Vec<&str> = line.split('|').collect();
    let cell = |col: usize, name: &str| -> Result<Vec<usize>> {
        let raw = cells.get(col).ok_or_else(|| ScribeError::Data {
            line: line_number,
            reason: format!("missing {} column", name),
        })?;
        let raw = raw.trim();
        let raw = raw
            .strip_prefix('"')
            .and_then(|r| r.strip_suffix('"'))
            .unwrap_or(raw);
        serde_json::from_str(raw).map_err(|e| ScribeError::Data {
            line: line_number,
            reason: format!("{} is not a JSON array of token ids: {}", name, e),
        })
    };

    let input = cell(x_col, "X")?;
    let target = cell(y_col, "y")?;
    if input.is_empty() {
        return Err(ScribeError::Data {
            line: line_number,
            reason: "empty example".to_string(),
        });
    }
    if input.len() != target.len() {
        return Err(ScribeError::Data {
            line: line_number,
            reason: format!("X has {} ids but y has {}", input.len(), target.len()),
        });
    }
    if let Some(&id) = input.iter().chain(&target).find(|&&id| id >= vocab_size) {
        return Err(ScribeError::Data {
            line: line_number,
            reason: format!("token id {} is outside the vocabulary of {}", id, vocab_size),
        });
    }
    Ok(Example { input, target })
}

/// Shuffle with a fixed seed, then hold out `val_fraction` of the examples.
///
/// The validation share is rounded up, so any non-zero fraction of a
/// non-empty corpus yields at least one validation example.
pub fn train_val_split(
    mut examples: Vec<Example>,
    val_fraction: f32,
    seed: u64,
) -> (Vec<Example>, Vec<Example>) {
    let mut rng = StdRng::seed_from_u64(seed);
    examples.shuffle(&mut rng);
    // 0.3f32 is slightly above 0.3; shave off that representation error so
    // 30 * 0.3 rounds up to 9, not 10
    let len = examples.len() as f64;
    let n_val = (len * f64::from(val_fraction) - len * 1e-7).ceil().max(0.0) as usize;
    let n_val = n_val.min(examples.len());
    let val = examples.split_off(examples.len() - n_val);
    (examples, val)
}

/// Pad inputs and targets to the longest example with `pad_id`.
pub fn collate(examples: &[&Example], pad_id: usize) -> Batch {
    let seq_len = examples.iter().map(|e| e.input.len()).max().unwrap_or(0);
    let pad = |ids: &[usize]| {
        let mut row = ids.to_vec();
        row.resize(seq_len, pad_id);
        row
    };
    Batch {
        inputs: examples.iter().map(|e| pad(&e.input)).collect(),
        targets: examples.iter().map(|e| pad(&e.target)).collect(),
    }
}

/// Batches over a fixed set of examples, reshuffled every epoch.
pub struct DataLoader {
    examples: Arc<Vec<Example>>,
    batch_size: usize,
    pad_id: usize,
    rng: Option<StdRng>,
}

impl DataLoader {
    /// `shuffle_seed: None` keeps corpus order.
    pub fn new(
        examples: Vec<Example>,
        batch_size: usize,
        pad_id: usize,
        shuffle_seed: Option<u64>,
    ) -> Self {
        assert!(batch_size > 0, "batch size must be positive");
        Self {
            examples: Arc::new(examples),
            batch_size,
            pad_id,
            rng: shuffle_seed.map(StdRng::seed_from_u64),
        }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// Batches per epoch; the last batch may be smaller.
    pub fn num_batches(&self) -> usize {
        self.examples.len().div_ceil(self.batch_size)
    }

    /// Start a new pass over the data.
    pub fn epoch(&mut self) -> Batches {
        let mut order: Vec<usize> = (0..self.examples.len()).collect();
        if let Some(rng) = &mut self.rng {
            order.shuffle(rng);
        }
        self.batches(order)
    }

    /// A pass in corpus order that leaves the shuffle state alone.
    pub fn in_order(&self) -> Batches {
        self.batches((0..self.examples.len()).collect())
    }

    fn batches(&self, order: Vec<usize>) -> Batches {
        Batches {
            examples: Arc::clone(&self.examples),
            order,
            position: 0,
            batch_size: self.batch_size,
            pad_id: self.pad_id,
        }
    }
}

/// One epoch of batches; owns what it needs so it can move to another thread.
pub struct Batches {
    examples: Arc<Vec<Example>>,
    order: Vec<usize>,
    position: usize,
    batch_size: usize,
    pad_id: usize,
}

impl Iterator for Batches {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let chunk: Vec<&Example> = self.order[self.position..end]
            .iter()
            .map(|&i| &self.examples[i])
            .collect();
        self.position = end;
        Some(collate(&chunk, self.pad_id))
    }
}

/// Builds batches on a background thread, handing them over through a
/// bounded channel in production order.
pub struct Prefetcher {
    receiver: Receiver<Batch>,
    worker: Option<JoinHandle<()>>,
}

impl Prefetcher {
    /// Start the worker; at most `capacity` finished batches wait in the queue.
    pub fn spawn<I>(batches: I, capacity: usize) -> Self
    where
        I: Iterator<Item = Batch> + Send + 'static,
    {
        let (sender, receiver) = sync_channel(capacity.max(1));
        let worker = thread::spawn(move || {
            for batch in batches {
                // receiver gone: the consumer stopped early
                if sender.send(batch).is_err() {
                    break;
                }
            }
        });
        Self {
            receiver,
            worker: Some(worker),
        }
    }
}

impl Iterator for Prefetcher {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        match self.receiver.recv() {
            Ok(batch) => Some(batch),
            Err(_) => {
                if let Some(worker) = self.worker.take() {
                    if worker.join().is_err() {
                        eprintln!("⚠️  prefetch worker panicked");
                    }
                }
                None
            }
        }
    }
}
