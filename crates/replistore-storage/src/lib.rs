#![warn(missing_docs)]

//! Replistore storage subsystem: content addressing, the per-replica blob store and
//! transfer log, directory archives for catch-up, and the replica command service.

pub mod address;
pub mod archive;
pub mod blob_store;
pub mod error;
pub mod service;
pub mod transfer_log;

pub use address::{hash_path, PathKey};
pub use blob_store::BlobStore;
pub use error::{StorageError, StorageResult};
pub use service::{StorageNodeService, UploadStatus};
pub use transfer_log::{TransferLog, TransferLogEntry};
