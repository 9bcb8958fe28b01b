//! Error types for the request-processing engine.

use std::path::PathBuf;

use thiserror::Error;

use crate::backend::BackendError;

/// Result type alias using the barrage error type.
pub type Result<T> = std::result::Result<T, BarrageError>;

/// Main error type for the engine.
///
/// Errors local to a single row never surface here: they are recorded as failed
/// responses. Only run-level problems propagate to the caller.
#[derive(Error, Debug)]
pub enum BarrageError {
    /// A metadata file exists but the request file it describes does not
    #[error(
        "Metadata file {} exists but request file {} is missing",
        .metadata.display(),
        .request_file.display()
    )]
    MissingRequestFile {
        request_file: PathBuf,
        metadata: PathBuf,
    },

    /// A metadata file could not be parsed
    #[error("Invalid metadata file {}: {source}", .path.display())]
    InvalidMetadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Some rows failed permanently while every response was required
    #[error("{failed} of {total} requests failed permanently and all responses are required")]
    RequiredResponsesMissing { failed: usize, total: usize },

    /// A submitted batch did not reach a terminal state in time
    #[error("Batch {batch_id} did not finish within {waited_secs}s")]
    BatchTimedOut { batch_id: String, waited_secs: u64 },

    /// A backend reported an error that cannot be handled per-row
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// The run was cancelled before all rows reached a terminal state
    #[error("Run cancelled")]
    Cancelled,

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Columnar cache artifact error
    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    /// Columnar cache artifact error
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<tempfile::PersistError> for BarrageError {
    fn from(err: tempfile::PersistError) -> Self {
        BarrageError::Io(err.error)
    }
}
