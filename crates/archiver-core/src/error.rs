//! Error types for archiver-core

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for archive operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Data store not found: {}", path.display())]
    SourceMissing { path: PathBuf },

    #[error("Failed to read {}: {source}", path.display())]
    ReadFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write {}: {source}", path.display())]
    WriteFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid archive {}: {reason}", path.display())]
    InvalidArchive { path: PathBuf, reason: String },

    #[error("Another backup or restore is already running")]
    Busy,

    #[error("Failed to clean up {}: {source}", path.display())]
    CleanupFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings IO error: {0}")]
    ConfigIo(String),

    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error(
        "Restore failed after the current data store was saved to {}: {reason}. \
         Restore from that copy manually if the data store is unusable.",
        safety_copy.display()
    )]
    RestoreInterrupted { safety_copy: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to read/write ZIP archive: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn read_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::ReadFailure {
            path: path.into(),
            source,
        }
    }

    /// Build a [`Error::WriteFailure`] for `path`
    pub(crate) fn write_failure(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::WriteFailure {
            path: path.into(),
            source,
        }
    }

    /// Build an [`Error::InvalidArchive`] for `path`
    pub(crate) fn invalid_archive(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidArchive {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is the cooperative-cancellation marker
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Result type alias for archive operations
pub type Result<T> = std::result::Result<T, Error>;
