use thiserror::Error;

/// The result type used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown architecture `{given}`, expected an index in 0..{available}")]
    UnknownArchitecture { given: String, available: usize },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("shape mismatch in {what}: got {got:?}, expected {expected:?}")]
    ShapeMismatch {
        what: &'static str,
        got: Vec<usize>,
        expected: Vec<usize>,
    },

    #[error("{0} dataset has no samples")]
    EmptyDataset(&'static str),

    #[error("non-finite loss {loss} at epoch {epoch}, batch {batch}")]
    NonFiniteLoss { epoch: usize, batch: usize, loss: f64 },

    #[error("optimizer was built for {expected} parameter tensors, model exposes {got}")]
    OptimizerMismatch { got: usize, expected: usize },

    #[error("metrics must be recorded in ascending epoch order: epoch {got} after {last}")]
    MetricsOrder { got: usize, last: usize },

    #[error("checkpoint does not match the model: {0}")]
    CheckpointMismatch(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
