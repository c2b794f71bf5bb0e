//! Error taxonomy for the migration pipeline.
//!
//! Per-item and per-pair failures are carried as values inside results.
//! Only `BatchAbort` and cancellation end a run early.

use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// A component could not be read when the asset was about to be created.
    #[error("Cannot read {}: {reason}", path.display())]
    FileAccess { path: PathBuf, reason: String },

    /// Transcoding a proprietary motion container failed.
    #[error("Conversion failed for {}: {reason}", path.display())]
    ConversionFailure { path: PathBuf, reason: String },

    /// The asset was created but the library does not treat it as a Live Photo.
    #[error("Pairing not recognized for asset {asset_id}")]
    PairingVerificationFailure { asset_id: String },

    #[error("Import failed: {reason}")]
    ImportFailure { reason: String },

    #[error("Cancelled")]
    Cancelled,

    /// The per-batch processing function itself failed.
    #[error("Batch {batch_index} aborted: {reason}")]
    BatchAbort { batch_index: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl PipelineError {
    pub fn file_access(path: &Path, err: impl std::fmt::Display) -> Self {
        PipelineError::FileAccess {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub fn conversion(path: &Path, err: impl std::fmt::Display) -> Self {
        PipelineError::ConversionFailure {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    pub fn import(err: impl std::fmt::Display) -> Self {
        PipelineError::ImportFailure {
            reason: err.to_string(),
        }
    }

    /// Whether the run can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, PipelineError::BatchAbort { .. } | PipelineError::Cancelled)
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
