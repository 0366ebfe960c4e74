//! Error types for Tunedrop core operations.
//!
//! Errors are grouped by domain. Everything that can go wrong while a
//! transfer is running is a [`TransferError`]; the transfer captures it into
//! its `error_string` and moves to `Failed` instead of propagating it.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tunedrop core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A transfer-level failure.
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// File system operation failed.
    #[error(transparent)]
    FileSystem(#[from] FileSystemError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures observed while driving a single transfer.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    /// Stream lookup failed or returned no candidates.
    #[error("Unable to resolve stream: {0}")]
    Resolution(String),

    /// Connection, timeout or HTTP error status.
    #[error("Network error: {0}")]
    Network(String),

    /// The server kept redirecting past the configured bound.
    #[error("Too many redirects (limit {limit})")]
    RedirectLimitExceeded {
        /// The configured redirect bound.
        limit: u32,
    },

    /// The server refused to honour a byte-range request.
    #[error("Server does not support resuming from byte {offset}")]
    RangeNotSupported {
        /// The requested resume offset.
        offset: u64,
    },

    /// Disk write, move or delete failure.
    #[error("File error: {0}")]
    Io(String),

    /// Post-processing failed.
    #[error("Conversion failed: {0}")]
    Conversion(String),
}

/// File system failures with the path involved.
#[derive(Debug, Error)]
pub enum FileSystemError {
    /// Reading a file failed.
    #[error("Failed to read {path}: {reason}")]
    ReadFailed {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Writing a file failed.
    #[error("Failed to write {path}: {reason}")]
    WriteFailed {
        /// Path that could not be written.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Creating a directory failed.
    #[error("Failed to create directory {path}: {reason}")]
    CreateDirFailed {
        /// Directory that could not be created.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Deleting a file failed.
    #[error("Failed to delete {path}: {reason}")]
    DeleteFailed {
        /// Path that could not be deleted.
        path: PathBuf,
        /// Underlying reason.
        reason: String,
    },

    /// Moving a file into place failed.
    #[error("Failed to move {source_path} to {destination}: {reason}")]
    MoveFailed {
        /// File being moved.
        source_path: PathBuf,
        /// Intended destination.
        destination: PathBuf,
        /// Underlying reason.
        reason: String,
    },
}

impl From<FileSystemError> for TransferError {
    fn from(err: FileSystemError) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<Error> for TransferError {
    fn from(err: Error) -> Self {
        match err {
            Error::Transfer(inner) => inner,
            Error::FileSystem(inner) => inner.into(),
            Error::Io(inner) => Self::Io(inner.to_string()),
            other => Self::Io(other.to_string()),
        }
    }
}
