//! Training Loop
//!
//! [`Trainer`] owns the model, the optimizer and both data loaders, and runs
//! the epoch/batch loop:
//!
//! ```text
//! for each epoch:
//!     for each batch:
//!         forward (with targets) → backward → AdamW step
//!         iteration += 1
//!         every eval_interval iterations:   estimate train/val loss
//!         every checkpoint_steps iterations: write chkpt_<iteration>.bin
//! ```
//!
//! The iteration counter runs across epochs, so checkpoint names never
//! collide between epochs.
//!
//! ## Evaluation
//!
//! Evaluation switches the model to inference mode (dropout off) for the
//! duration of an [`InferenceGuard`], averages the loss over at most
//! `eval_iters` batches from an in-order pass over each split, and restores
//! training mode when the guard drops, including on an early `?` return.
//! Evaluation never draws from the training shuffle, so the batch order of a
//! run does not depend on how often it is evaluated.
//!
//! ## Failure Policy
//!
//! - A non-finite loss aborts the run before the optimizer step, so no
//!   diverged weights are ever checkpointed.
//! - A checkpoint write that fails is reported on stderr and counted in the
//!   [`TrainingReport`]; training carries on with the update already applied.

use crate::checkpoint::{Checkpoint, CheckpointMetadata};
use crate::config::Config;
use crate::data::{Batch, DataLoader, Example, Prefetcher};
use crate::error::{Result, ScribeError};
use crate::model::LanguageModel;
use crate::optimizer::AdamW;
use crate::training_logger::TrainingLogger;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};

/// What the trainer is doing right now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Training,
    Evaluating,
    Checkpointing,
}

/// One loss estimate.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub iteration: usize,
    pub train_loss: f32,
    /// `NaN` when the validation split is empty.
    pub val_loss: f32,
}

/// Summary of a finished run.
#[derive(Debug, Default)]
pub struct TrainingReport {
    pub iterations: usize,
    pub epochs: usize,
    pub last_train_loss: Option<f32>,
    pub evaluations: Vec<Evaluation>,
    pub checkpoints: Vec<PathBuf>,
    pub checkpoint_failures: usize,
}

/// Iterations between evaluations for an epoch of `batches_per_epoch`
/// batches: half an epoch when that is a whole number, a full epoch
/// otherwise.
pub fn eval_interval(batches_per_epoch: usize) -> usize {
    if batches_per_epoch >= 2 && batches_per_epoch % 2 == 0 {
        batches_per_epoch / 2
    } else {
        batches_per_epoch.max(1)
    }
}

/// Dropout-free access to a model; training mode comes back on drop.
pub struct InferenceGuard<'a> {
    model: &'a mut LanguageModel,
    was_training: bool,
}

impl<'a> InferenceGuard<'a> {
    pub fn new(model: &'a mut LanguageModel) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self {
            model,
            was_training,
        }
    }
}

impl Deref for InferenceGuard<'_> {
    type Target = LanguageModel;

    fn deref(&self) -> &LanguageModel {
        self.model
    }
}

impl Drop for InferenceGuard<'_> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}

pub struct Trainer {
    pub model: LanguageModel,
    pub optimizer: AdamW,
    config: Config,
    train_loader: DataLoader,
    val_loader: DataLoader,
    checkpoint_dir: PathBuf,
    logger: Option<TrainingLogger>,
    prefetch: Option<usize>,
    phase: Phase,
    iteration: usize,
    last_eval: Option<Evaluation>,
}

impl Trainer {
    /// Build a fresh model and optimizer for `config` and create the
    /// checkpoint directory.
    ///
    /// The training split is reshuffled every epoch from a generator seeded
    /// with `config.seed`; the validation split is read in order.
    pub fn new<P: AsRef<Path>>(
        config: Config,
        train: Vec<Example>,
        val: Vec<Example>,
        checkpoint_dir: P,
    ) -> Result<Self> {
        config.validate()?;
        if train.is_empty() {
            return Err(ScribeError::EmptyCorpus("training split".to_string()));
        }
        let model = LanguageModel::new(&config)?;
        let optimizer = AdamW::new(&model, config.learning_rate);

        let checkpoint_dir = checkpoint_dir.as_ref().to_path_buf();
        fs::create_dir_all(&checkpoint_dir)?;

        let train_loader = DataLoader::new(train, config.batch_size, config.pad_id, Some(config.seed));
        let val_loader = DataLoader::new(val, config.batch_size, config.pad_id, None);

        Ok(Self {
            model,
            optimizer,
            config,
            train_loader,
            val_loader,
            checkpoint_dir,
            logger: None,
            prefetch: None,
            phase: Phase::Training,
            iteration: 0,
            last_eval: None,
        })
    }

    /// Append every evaluation to a CSV log.
    pub fn with_logger(mut self, logger: TrainingLogger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Build training batches on a background thread, keeping up to
    /// `capacity` of them queued.
    pub fn with_prefetch(mut self, capacity: usize) -> Self {
        self.prefetch = Some(capacity);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Optimizer steps taken so far.
    pub fn iteration(&self) -> usize {
        self.iteration
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run every epoch.
    pub fn run(&mut self) -> Result<TrainingReport> {
        let mut report = TrainingReport::default();
        let batches_per_epoch = self.train_loader.num_batches();
        let interval = eval_interval(batches_per_epoch);

        println!(
            "Training on {} examples ({} batches/epoch), validating on {}",
            self.train_loader.len(),
            batches_per_epoch,
            self.val_loader.len()
        );
        println!(
            "Evaluating every {} iterations, checkpointing every {}",
            interval, self.config.checkpoint_steps
        );
        println!();

        self.model.set_training(true);
        for epoch in 0..self.config.epochs {
            let epoch_batches = self.train_loader.epoch();
            let batches: Box<dyn Iterator<Item = Batch>> = match self.prefetch {
                Some(capacity) => Box::new(Prefetcher::spawn(epoch_batches, capacity)),
                None => Box::new(epoch_batches),
            };

            for batch in batches {
                let loss = self.train_step(&batch)?;
                report.last_train_loss = Some(loss);

                if self.iteration % interval == 0 {
                    let evaluation = self.evaluate()?;
                    report.evaluations.push(evaluation);
                }
                if self.iteration % self.config.checkpoint_steps == 0 {
                    self.checkpoint(epoch, report.last_train_loss, &mut report);
                }
            }
            report.epochs = epoch + 1;
            println!("Epoch {} complete ({} iterations)", epoch + 1, self.iteration);
        }

        report.iterations = self.iteration;
        if report.checkpoint_failures > 0 {
            eprintln!(
                "⚠️  {} checkpoint write(s) failed during this run",
                report.checkpoint_failures
            );
        }
        Ok(report)
    }

    /// One optimizer step on `batch`; returns the loss before the update.
    pub fn train_step(&mut self, batch: &Batch) -> Result<f32> {
        self.phase = Phase::Training;
        let (loss, cache) = self.model.forward_train(&batch.inputs, &batch.targets)?;
        if !loss.is_finite() {
            return Err(ScribeError::NonFiniteLoss {
                iteration: self.iteration + 1,
                loss,
            });
        }
        let grads = self.model.backward(&cache);
        self.optimizer.step(&mut self.model, &grads);
        self.iteration += 1;
        Ok(loss)
    }

    /// Estimate the loss on both splits without dropout.
    pub fn evaluate(&mut self) -> Result<Evaluation> {
        self.phase = Phase::Evaluating;
        let eval_iters = self.config.eval_iters;
        let losses = {
            let model = InferenceGuard::new(&mut self.model);
            mean_loss(&model, self.train_loader.in_order(), eval_iters).and_then(|train_loss| {
                let val_loss = mean_loss(&model, self.val_loader.in_order(), eval_iters)?;
                Ok((train_loss, val_loss))
            })
        };
        self.phase = Phase::Training;
        let (train_loss, val_loss) = losses?;

        let evaluation = Evaluation {
            iteration: self.iteration,
            train_loss,
            val_loss,
        };
        match &mut self.logger {
            Some(logger) => {
                if let Err(e) = logger.log(
                    self.iteration,
                    self.optimizer.config.lr,
                    train_loss,
                    val_loss,
                ) {
                    eprintln!("⚠️  could not write training log: {}", e);
                }
            }
            None => println!(
                "step {}: train loss {:.4}, val loss {:.4}",
                self.iteration, train_loss, val_loss
            ),
        }
        self.last_eval = Some(evaluation);
        Ok(evaluation)
    }

    fn checkpoint(&mut self, epoch: usize, train_loss: Option<f32>, report: &mut TrainingReport) {
        self.phase = Phase::Checkpointing;
        let path = self
            .checkpoint_dir
            .join(Checkpoint::file_name(self.iteration));
        let metadata = CheckpointMetadata {
            iteration: self.iteration,
            epoch,
            train_loss,
            val_loss: self.last_eval.map(|e| e.val_loss),
        };
        match Checkpoint::save(&path, &self.model, Some(&self.optimizer), &metadata) {
            Ok(()) => report.checkpoints.push(path),
            Err(e) => {
                eprintln!(
                    "⚠️  checkpoint at iteration {} failed ({}): {}",
                    self.iteration,
                    path.display(),
                    e
                );
                report.checkpoint_failures += 1;
            }
        }
        self.phase = Phase::Training;
    }
}

/// Mean loss over the first `limit` batches; `NaN` if there are none.
fn mean_loss(
    model: &LanguageModel,
    batches: impl Iterator<Item = Batch>,
    limit: usize,
) -> Result<f32> {
    let mut total = 0.0;
    let mut count = 0;
    for batch in batches.take(limit) {
        let output = model.forward(&batch.inputs, Some(batch.targets.as_slice()))?;
        total += output.loss.unwrap_or(f32::NAN);
        count += 1;
    }
    if count == 0 {
        return Ok(f32::NAN);
    }
    Ok(total / count as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Visit;

    /// Sequences that count upwards, wrapping below the special ids.
    fn counting_examples(n: usize, len: usize, vocab: usize) -> Vec<Example> {
        let base = vocab - 2;
        (0..n)
            .map(|i| {
                let ids: Vec<usize> = (0..=len).map(|j| (i + j) % base).collect();
                Example {
                    input: ids[..len].to_vec(),
                    target: ids[1..].to_vec(),
                }
            })
            .collect()
    }

    fn tiny_trainer(dir: &Path, epochs: usize, checkpoint_steps: usize) -> Trainer {
        let mut config = Config::tiny(12);
        config.epochs = epochs;
        config.checkpoint_steps = checkpoint_steps;
        config.learning_rate = 1e-2;
        Trainer::new(
            config,
            counting_examples(16, 6, 12),
            counting_examples(4, 6, 12),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_eval_interval() {
        assert_eq!(eval_interval(10), 5);
        assert_eq!(eval_interval(2), 1);
        assert_eq!(eval_interval(7), 7);
        assert_eq!(eval_interval(1), 1);
        assert_eq!(eval_interval(0), 1);
    }

    #[test]
    fn test_run_counts_iterations_evaluations_and_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path(), 2, 3);
        // 16 examples / batch 4 = 4 batches per epoch, evaluated every 2
        let report = trainer.run().unwrap();

        assert_eq!(report.iterations, 8);
        assert_eq!(report.epochs, 2);
        assert_eq!(report.evaluations.len(), 4);
        assert_eq!(
            report.evaluations.iter().map(|e| e.iteration).collect::<Vec<_>>(),
            vec![2, 4, 6, 8]
        );
        assert_eq!(report.checkpoint_failures, 0);
        assert_eq!(
            report.checkpoints,
            vec![dir.path().join("chkpt_3.bin"), dir.path().join("chkpt_6.bin")]
        );
        for path in &report.checkpoints {
            assert!(path.exists());
        }
        assert_eq!(trainer.phase(), Phase::Training);
        assert!(trainer.model.is_training());
    }

    #[test]
    fn test_checkpoint_holds_optimizer_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path(), 1, 4);
        trainer.run().unwrap();

        let checkpoint = Checkpoint::load(dir.path().join("chkpt_4.bin")).unwrap();
        assert_eq!(checkpoint.metadata.iteration, 4);
        assert_eq!(checkpoint.metadata.epoch, 0);
        assert!(checkpoint.metadata.train_loss.is_some());
        let optimizer = checkpoint.optimizer.unwrap();
        assert_eq!(optimizer.step, 4);
    }

    #[test]
    fn test_training_reduces_loss() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path(), 15, 1000);
        let report = trainer.run().unwrap();

        let first = report.evaluations.first().unwrap().train_loss;
        let last = report.evaluations.last().unwrap().train_loss;
        assert!(last < first, "train loss {} -> {}", first, last);
        assert!(report.checkpoints.is_empty());
    }

    #[test]
    fn test_failed_checkpoint_is_counted_and_training_continues() {
        let dir = tempfile::tempdir().unwrap();
        let ckpt_dir = dir.path().join("ckpts");
        let mut trainer = tiny_trainer(&ckpt_dir, 1, 2);
        // a file where the directory should be makes every write fail
        fs::remove_dir(&ckpt_dir).unwrap();
        fs::write(&ckpt_dir, b"not a directory").unwrap();

        let report = trainer.run().unwrap();
        assert_eq!(report.iterations, 4);
        assert_eq!(report.checkpoint_failures, 2);
        assert!(report.checkpoints.is_empty());
        assert_eq!(trainer.optimizer.step, 4);
    }

    #[test]
    fn test_non_finite_loss_aborts_before_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path(), 1, 1);
        trainer.model.lm_head.bias.as_mut().unwrap().data[0] = f32::NAN;

        let err = trainer.run().unwrap_err();
        assert!(matches!(err, ScribeError::NonFiniteLoss { iteration: 1, .. }));
        assert_eq!(trainer.optimizer.step, 0);
        assert_eq!(trainer.iteration(), 0);
        assert!(!dir.path().join("chkpt_1.bin").exists());
    }

    #[test]
    fn test_evaluate_restores_training_mode() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = tiny_trainer(dir.path(), 1, 1000);
        trainer.model.set_training(true);

        let evaluation = trainer.evaluate().unwrap();
        assert!(trainer.model.is_training());
        assert_eq!(trainer.phase(), Phase::Training);
        assert!(evaluation.train_loss > 0.0);
        assert!(evaluation.val_loss.is_finite());
    }

    #[test]
    fn test_empty_validation_split_gives_nan() {
        let dir = tempfile::tempdir().unwrap();
        let trainer_config = Config::tiny(12);
        let mut trainer = Trainer::new(
            trainer_config,
            counting_examples(4, 5, 12),
            Vec::new(),
            dir.path(),
        )
        .unwrap();
        let evaluation = trainer.evaluate().unwrap();
        assert!(evaluation.train_loss.is_finite());
        assert!(evaluation.val_loss.is_nan());
    }

    #[test]
    fn test_prefetched_run_matches_direct_run() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut direct = tiny_trainer(dir_a.path(), 2, 1000);
        let mut prefetched = tiny_trainer(dir_b.path(), 2, 1000).with_prefetch(2);
        direct.run().unwrap();
        prefetched.run().unwrap();

        let mut a = Vec::new();
        direct.model.visit("", &mut |_, t| a.extend_from_slice(&t.data));
        let mut b = Vec::new();
        prefetched.model.visit("", &mut |_, t| b.extend_from_slice(&t.data));
        assert_eq!(a, b);
    }

    #[test]
    fn test_out_of_vocabulary_row_is_skipped_and_run_completes() {
        use crate::data::Corpus;

        let mut text = String::from("X|y\n");
        for example in counting_examples(16, 6, 12) {
            text.push_str(&format!("{:?}|{:?}\n", example.input, example.target));
        }
        text.push_str("[1, 500]|[500, 2]\n");
        let corpus = Corpus::parse(&text, 8, 12, "inline").unwrap();
        assert_eq!(corpus.len(), 16);
        assert_eq!(corpus.skipped, 1);

        let dir = tempfile::tempdir().unwrap();
        let mut trainer =
            Trainer::new(Config::tiny(12), corpus.examples, Vec::new(), dir.path()).unwrap();
        let report = trainer.run().unwrap();
        assert_eq!(report.epochs, 1);
        assert_eq!(report.iterations, 4);
    }

    #[test]
    fn test_evaluation_does_not_change_training_order() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        let mut evaluated = tiny_trainer(dir_a.path(), 1, 1000);
        let mut untouched = tiny_trainer(dir_b.path(), 1, 1000);

        for _ in 0..3 {
            evaluated.evaluate().unwrap();
        }
        let a: Vec<Batch> = evaluated.train_loader.epoch().collect();
        let b: Vec<Batch> = untouched.train_loader.epoch().collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_training_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = Trainer::new(Config::tiny(12), Vec::new(), Vec::new(), dir.path());
        assert!(matches!(result, Err(ScribeError::EmptyCorpus(_))));
    }

    #[test]
    fn test_logger_receives_every_evaluation() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("log.csv");
        let logger = TrainingLogger::new(&log_path).unwrap();
        let mut trainer = tiny_trainer(dir.path(), 1, 1000).with_logger(logger);
        trainer.run().unwrap();

        let text = fs::read_to_string(&log_path).unwrap();
        // header + evaluations at iterations 2 and 4
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().nth(2).unwrap().starts_with("4,"));
    }
}
