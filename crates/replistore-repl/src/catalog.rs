//! File catalog: which versions of which files a user has, and which replicas hold each
//! version.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReplError, Result};

/// One stored version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    /// Version id.
    pub id: String,
    /// Blob name on every replica (`UploadHash`). Never changes once assigned.
    pub content_hash: String,
    /// When the coordinator accepted the upload.
    pub created_at: DateTime<Utc>,
    /// Replicas that acknowledged the write. Only grows.
    pub storages: BTreeSet<String>,
}

/// One logical file of a user: a `(name, path)` pair and its versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// File id.
    pub id: String,
    /// File name as uploaded.
    pub name: String,
    /// Directory the file was uploaded from.
    pub path: String,
    /// First upload time.
    pub uploaded_at: DateTime<Utc>,
    /// Owner email.
    pub uploaded_by: String,
    /// Versions, oldest first.
    pub versions: Vec<FileVersion>,
}

impl FileRecord {
    /// Most recent version.
    pub fn latest(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    /// Version by id.
    pub fn version(&self, version_id: &str) -> Option<&FileVersion> {
        self.versions.iter().find(|v| v.id == version_id)
    }
}

/// How a download names the file it wants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    /// By file id.
    Id(String),
    /// By name and directory.
    Name {
        /// File name.
        name: String,
        /// Directory.
        path: String,
    },
}

impl FileLookup {
    fn describe(&self) -> String {
        match self {
            FileLookup::Id(id) => id.clone(),
            FileLookup::Name { name, path } => format!("{}/{}", path.trim_end_matches('/'), name),
        }
    }

    fn matches(&self, record: &FileRecord) -> bool {
        match self {
            FileLookup::Id(id) => &record.id == id,
            FileLookup::Name { name, path } => &record.name == name && &record.path == path,
        }
    }
}

/// Metadata store the coordinator records uploads in.
#[async_trait]
pub trait Catalog: Send + Sync + 'static {
    /// Append a version to the `(name, path)` record of `email`, creating the record if
    /// needed. Returns the record id and the new version (with no storages yet).
    async fn record_upload(
        &self,
        email: &str,
        name: &str,
        path: &str,
        content_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(String, FileVersion)>;

    /// Add a replica to a version's `storages`.
    async fn add_storage(&self, email: &str, file_id: &str, version_id: &str, node_id: &str) -> Result<()>;

    /// Find a record and one of its versions (`version_id`, or the latest).
    async fn resolve_version(
        &self,
        email: &str,
        lookup: &FileLookup,
        version_id: Option<&str>,
    ) -> Result<(FileRecord, FileVersion)>;

    /// Every record of a user.
    async fn list_files(&self, email: &str) -> Result<Vec<FileRecord>>;
}

/// In-process [`Catalog`].
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    users: Mutex<HashMap<String, Vec<FileRecord>>>,
}

impl MemoryCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn record_upload(
        &self,
        email: &str,
        name: &str,
        path: &str,
        content_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<(String, FileVersion)> {
        let version = FileVersion {
            id: Uuid::new_v4().to_string(),
            content_hash: content_hash.to_string(),
            created_at: at,
            storages: BTreeSet::new(),
        };
        let mut users = self.users.lock();
        let records = users.entry(email.to_string()).or_default();
        let lookup = FileLookup::Name {
            name: name.to_string(),
            path: path.to_string(),
        };
        let file_id = match records.iter_mut().find(|r| lookup.matches(r)) {
            Some(record) => {
                record.versions.push(version.clone());
                record.id.clone()
            }
            None => {
                let record = FileRecord {
                    id: Uuid::new_v4().to_string(),
                    name: name.to_string(),
                    path: path.to_string(),
                    uploaded_at: at,
                    uploaded_by: email.to_string(),
                    versions: vec![version.clone()],
                };
                let id = record.id.clone();
                records.push(record);
                id
            }
        };
        Ok((file_id, version))
    }

    async fn add_storage(&self, email: &str, file_id: &str, version_id: &str, node_id: &str) -> Result<()> {
        let mut users = self.users.lock();
        let record = users
            .get_mut(email)
            .and_then(|records| records.iter_mut().find(|r| r.id == file_id))
            .ok_or_else(|| ReplError::FileNotFound {
                email: email.to_string(),
                file: file_id.to_string(),
            })?;
        let version = record
            .versions
            .iter_mut()
            .find(|v| v.id == version_id)
            .ok_or_else(|| ReplError::VersionNotFound {
                file_id: file_id.to_string(),
                version_id: version_id.to_string(),
            })?;
        version.storages.insert(node_id.to_string());
        Ok(())
    }

    async fn resolve_version(
        &self,
        email: &str,
        lookup: &FileLookup,
        version_id: Option<&str>,
    ) -> Result<(FileRecord, FileVersion)> {
        let users = self.users.lock();
        let record = users
            .get(email)
            .and_then(|records| records.iter().find(|r| lookup.matches(r)))
            .ok_or_else(|| ReplError::FileNotFound {
                email: email.to_string(),
                file: lookup.describe(),
            })?;
        let version = match version_id {
            Some(id) => record.version(id),
            None => record.latest(),
        }
        .ok_or_else(|| ReplError::VersionNotFound {
            file_id: record.id.clone(),
            version_id: version_id.unwrap_or("latest").to_string(),
        })?;
        Ok((record.clone(), version.clone()))
    }

    async fn list_files(&self, email: &str) -> Result<Vec<FileRecord>> {
        Ok(self.users.lock().get(email).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_name(name: &str, path: &str) -> FileLookup {
        FileLookup::Name {
            name: name.to_string(),
            path: path.to_string(),
        }
    }

    #[tokio::test]
    async fn test_versions_accumulate_on_one_record() {
        let catalog = MemoryCatalog::new();
        let (id1, v1) = catalog
            .record_upload("a@x.com", "report.pdf", "/docs", "h1", Utc::now())
            .await
            .unwrap();
        let (id2, v2) = catalog
            .record_upload("a@x.com", "report.pdf", "/docs", "h2", Utc::now())
            .await
            .unwrap();
        assert_eq!(id1, id2);
        assert_ne!(v1.id, v2.id);

        let files = catalog.list_files("a@x.com").await.unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].versions.len(), 2);

        let (_, latest) = catalog
            .resolve_version("a@x.com", &FileLookup::Id(id1.clone()), None)
            .await
            .unwrap();
        assert_eq!(latest.content_hash, "h2");
        let (_, first) = catalog
            .resolve_version("a@x.com", &by_name("report.pdf", "/docs"), Some(&v1.id))
            .await
            .unwrap();
        assert_eq!(first.content_hash, "h1");
    }

    #[tokio::test]
    async fn test_records_are_per_user_and_path() {
        let catalog = MemoryCatalog::new();
        catalog.record_upload("a@x.com", "f", "/one", "h", Utc::now()).await.unwrap();
        catalog.record_upload("a@x.com", "f", "/two", "h", Utc::now()).await.unwrap();
        catalog.record_upload("b@x.com", "f", "/one", "h", Utc::now()).await.unwrap();
        assert_eq!(catalog.list_files("a@x.com").await.unwrap().len(), 2);
        assert_eq!(catalog.list_files("b@x.com").await.unwrap().len(), 1);
        assert!(catalog.list_files("c@x.com").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_storages_grow_without_duplicates() {
        let catalog = MemoryCatalog::new();
        let (file_id, version) = catalog
            .record_upload("a@x.com", "f", "/", "h", Utc::now())
            .await
            .unwrap();
        assert!(version.storages.is_empty());
        for node in ["r2", "r1", "r2"] {
            catalog.add_storage("a@x.com", &file_id, &version.id, node).await.unwrap();
        }
        let (_, version) = catalog
            .resolve_version("a@x.com", &FileLookup::Id(file_id), None)
            .await
            .unwrap();
        assert_eq!(version.storages.into_iter().collect::<Vec<_>>(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_missing_lookups() {
        let catalog = MemoryCatalog::new();
        let err = catalog
            .resolve_version("a@x.com", &by_name("nope", "/"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::FileNotFound { .. }));

        let (file_id, _) = catalog.record_upload("a@x.com", "f", "/", "h", Utc::now()).await.unwrap();
        let err = catalog
            .resolve_version("a@x.com", &FileLookup::Id(file_id.clone()), Some("v-missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::VersionNotFound { .. }));
        let err = catalog.add_storage("a@x.com", &file_id, "v-missing", "r1").await.unwrap_err();
        assert!(matches!(err, ReplError::VersionNotFound { .. }));
    }
}
