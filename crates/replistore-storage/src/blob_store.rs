//! Local blob namespace of one replica.
//!
//! Layout under the data directory:
//! `uploads/<sharded path>/<blob hash>`, `logs/<YYYY-MM-DD>.json`, `backups/` (scratch
//! space for gap-replay archives).

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Subdirectory holding replicated blobs.
pub const UPLOADS_DIR: &str = "uploads";
/// Subdirectory holding daily transfer logs.
pub const LOGS_DIR: &str = "logs";
/// Subdirectory holding transient cacheup scratch directories.
pub const BACKUPS_DIR: &str = "backups";

/// Blob storage rooted at a replica's data directory.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

impl BlobStore {
    /// Open (creating if needed) the storage layout under `data_dir`.
    pub async fn open(data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = data_dir.into();
        for dir in [UPLOADS_DIR, LOGS_DIR, BACKUPS_DIR] {
            tokio::fs::create_dir_all(root.join(dir)).await?;
        }
        debug!(root = %root.display(), "blob store opened");
        Ok(Self { root })
    }

    /// The data directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `uploads/` directory.
    pub fn uploads_dir(&self) -> PathBuf {
        self.root.join(UPLOADS_DIR)
    }

    /// `logs/` directory.
    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    /// `backups/` directory.
    pub fn backups_dir(&self) -> PathBuf {
        self.root.join(BACKUPS_DIR)
    }

    /// Location of a blob, rejecting paths that would leave `uploads/`.
    pub fn blob_path(&self, upload_path: &str, hash: &str) -> StorageResult<PathBuf> {
        Ok(self
            .uploads_dir()
            .join(relative(upload_path)?)
            .join(relative(hash)?))
    }

    /// Write a blob, creating its shard directories.
    pub async fn write_blob(&self, upload_path: &str, hash: &str, data: &[u8]) -> StorageResult<PathBuf> {
        let path = self.blob_path(upload_path, hash)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        debug!(path = %path.display(), bytes = data.len(), "blob written");
        Ok(path)
    }

    /// Read a blob; a missing file is [`StorageError::BlobNotFound`].
    pub async fn read_blob(&self, upload_path: &str, hash: &str) -> StorageResult<Vec<u8>> {
        let path = self.blob_path(upload_path, hash)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound { path })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Whether a blob exists.
    pub async fn contains(&self, upload_path: &str, hash: &str) -> bool {
        match self.blob_path(upload_path, hash) {
            Ok(path) => tokio::fs::try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Copy a blob into `dest_root`, mirroring its path relative to `uploads/`.
    pub async fn copy_blob_into(&self, upload_path: &str, hash: &str, dest_root: &Path) -> StorageResult<PathBuf> {
        let source = self.blob_path(upload_path, hash)?;
        let dest = dest_root.join(relative(upload_path)?).join(relative(hash)?);
        if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
            return Err(StorageError::BlobNotFound { path: source });
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        match tokio::fs::copy(&source, &dest).await {
            Ok(_) => Ok(dest),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::BlobNotFound { path: source })
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn relative(path: &str) -> StorageResult<PathBuf> {
    let candidate = Path::new(path);
    let safe = !path.is_empty()
        && candidate
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if safe {
        Ok(candidate.to_path_buf())
    } else {
        Err(StorageError::InvalidPath {
            path: path.to_string(),
        })
    }
}
