//! Error types
//!
//! Every fallible public operation in the crate returns [`Result`], whose
//! error side is [`ScribeError`]. Shape invariants *inside* tensor kernels are
//! still checked with `assert!`: by the time data reaches a kernel it has
//! already been validated at the API boundary, so a failure there is a bug.

use thiserror::Error;

/// Errors produced while configuring, training, checkpointing or sampling.
#[derive(Debug, Error)]
pub enum ScribeError {
    /// Inconsistent hyperparameters, detected when a model or trainer is built.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A batch or prompt that the model cannot consume.
    #[error("invalid model input: {0}")]
    Input(String),

    /// A corpus row that could not be parsed.
    #[error("corpus line {line}: {reason}")]
    Data { line: usize, reason: String },

    /// The corpus contained no usable rows.
    #[error("corpus {0} contains no valid rows")]
    EmptyCorpus(String),

    /// The requested compute device does not exist in this build.
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Corrupt, truncated or incompatible checkpoint.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// Training diverged.
    #[error("non-finite loss {loss} at iteration {iteration}")]
    NonFiniteLoss { iteration: usize, loss: f32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ScribeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScribeError::Config("n_embd (10) must be divisible by n_head (3)".to_string());
        assert!(err.to_string().contains("invalid configuration"));
        assert!(err.to_string().contains("n_head (3)"));

        let err = ScribeError::Data {
            line: 7,
            reason: "X is not a JSON array".to_string(),
        };
        assert_eq!(err.to_string(), "corpus line 7: X is not a JSON array");

        let err = ScribeError::NonFiniteLoss {
            iteration: 12,
            loss: f32::NAN,
        };
        assert!(err.to_string().contains("iteration 12"));
    }

    #[test]
    fn test_io_error_converts() {
        fn open_missing() -> Result<std::fs::File> {
            Ok(std::fs::File::open("/definitely/not/here.bin")?)
        }
        assert!(matches!(open_missing(), Err(ScribeError::Io(_))));
    }
}
