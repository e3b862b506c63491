use std::path::PathBuf;
use thiserror::Error;

/// Error type for failures that abort a batch.
///
/// Model-reported failures for a single timestamp are not represented here,
/// see [`crate::executor::ModelError`].
#[derive(Error, Debug)]
pub enum FfpError {
    #[error("{0}")]
    Error(String),
    #[error("Invalid grid: {0}")]
    InvalidGrid(String),
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Invalid input data: {0}")]
    Input(String),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Volume store {path}: {message}")]
    Store { path: PathBuf, message: String },
    #[error("Chunk {index} of {path} is corrupt: {reason}")]
    CorruptChunk {
        path: PathBuf,
        index: usize,
        reason: String,
    },
    #[error("Model broke its output contract: {0}")]
    ModelContract(String),
    #[error("Chunk {index} failed in its worker: {message}")]
    ChunkFailed { index: usize, message: String },
    #[error("Worker pool failure: {0}")]
    WorkerPool(String),
    #[error("Volume {path} is incomplete: {missing} of {total} chunks were never written")]
    IncompleteVolume {
        path: PathBuf,
        missing: usize,
        total: usize,
    },
}

impl FfpError {
    /// Attach a path to an [`std::io::Error`]
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        FfpError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Convenience type for `Result<T, FfpError>`.
pub type FfpResult<T> = Result<T, FfpError>;
