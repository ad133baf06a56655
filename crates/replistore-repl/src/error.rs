//! Error types for the replication subsystem.

use replistore_storage::StorageError;
use replistore_transport::TransportError;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplError>;

/// Errors that can occur in the registry, coordinator and catch-up paths.
#[derive(Debug, Error)]
pub enum ReplError {
    /// Dial, framing or codec failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Local replica storage failure.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A membership snapshot or bus event could not be (de)serialized.
    #[error("membership encoding error: {0}")]
    MembershipEncoding(#[from] serde_json::Error),

    /// A reply could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The request carried no sender identity.
    #[error("request has no owning user")]
    MissingSender,

    /// A request lacked a metadata key the command needs.
    #[error("missing packet metadata: {key}")]
    MissingMeta {
        /// The absent key.
        key: &'static str,
    },

    /// No catalog record matches the request.
    #[error("file not found for {email}: {file}")]
    FileNotFound {
        /// Owning user.
        email: String,
        /// File id or `dir/name` that was looked up.
        file: String,
    },

    /// The record exists but has no such version.
    #[error("version {version_id} not found for file {file_id}")]
    VersionNotFound {
        /// File id.
        file_id: String,
        /// Requested version id.
        version_id: String,
    },

    /// None of the replicas holding a version is a current member.
    #[error("no live replica holds version {version_id}")]
    NoLiveHolder {
        /// The unreachable version.
        version_id: String,
    },

    /// A replica reported that it did not store an upload.
    #[error("replica {node_id} rejected upload: {reason}")]
    UploadRejected {
        /// Replica id.
        node_id: String,
        /// Reason reported by the replica.
        reason: String,
    },
}
