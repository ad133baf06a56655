//! Error types for the storage subsystem.

use std::path::PathBuf;

use replistore_transport::TransportError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for replica storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Framing, dialing or decode failure on the connection.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The requested blob does not exist on this replica.
    #[error("blob not found: {}", path.display())]
    BlobNotFound {
        /// Path that was looked up.
        path: PathBuf,
    },

    /// A packet lacked a metadata key the command needs.
    #[error("missing packet metadata: {key}")]
    MissingMeta {
        /// The absent key.
        key: &'static str,
    },

    /// An upload packet arrived without a payload.
    #[error("upload packet has no payload")]
    MissingPayload,

    /// A relative path tried to escape the storage root.
    #[error("invalid storage path: {path}")]
    InvalidPath {
        /// The rejected path.
        path: String,
    },

    /// Building or unpacking a directory archive failed.
    #[error("archive error: {0}")]
    Archive(String),

    /// The daily transfer log could not be read or written.
    #[error("transfer log error: {0}")]
    TransferLog(String),

    /// A `YYYY-MM-DD` date could not be parsed.
    #[error("invalid date {value:?}: expected YYYY-MM-DD")]
    InvalidDate {
        /// The rejected value.
        value: String,
    },
}

impl From<zip::result::ZipError> for StorageError {
    fn from(e: zip::result::ZipError) -> Self {
        StorageError::Archive(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::TransferLog(e.to_string())
    }
}
