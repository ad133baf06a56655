//! Daily transfer log of a replica.
//!
//! Every successful upload appends one [`TransferLogEntry`] to `logs/<YYYY-MM-DD>.json`,
//! a JSON array per day. Appends are read-modify-write; the log serializes them with an
//! in-process mutex so concurrent connections on one replica do not drop entries.
//! Gap replay reads every day file in an inclusive date range and skips missing days.

use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use replistore_transport::protocol::meta_keys;
use replistore_transport::TransferPacket;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Date format of log file names and `StartSpan` values.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Parse a `YYYY-MM-DD` date.
pub fn parse_day(value: &str) -> StorageResult<NaiveDate> {
    NaiveDate::parse_from_str(value, DATE_FORMAT).map_err(|_| StorageError::InvalidDate {
        value: value.to_string(),
    })
}

/// Today in the replica's local time zone.
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

/// One logged transfer: enough of the packet metadata to replay it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLogEntry {
    /// Command name (`upload`).
    pub command: String,
    /// `UploadPath` of the blob.
    pub upload_path: String,
    /// `UploadHash` of the blob.
    pub upload_hash: String,
    /// Day the entry was logged.
    pub uploaded_in: String,
    /// Original file name, when the packet carried one.
    #[serde(default)]
    pub file_name: Option<String>,
    /// Owner of the blob.
    #[serde(default)]
    pub sender_email: String,
}

impl TransferLogEntry {
    /// Build an entry from a packet (its payload is never logged).
    pub fn from_packet(packet: &TransferPacket, day: NaiveDate) -> StorageResult<Self> {
        let upload_path = packet
            .meta(meta_keys::UPLOAD_PATH)
            .ok_or(StorageError::MissingMeta {
                key: meta_keys::UPLOAD_PATH,
            })?;
        let upload_hash = packet
            .meta(meta_keys::UPLOAD_HASH)
            .ok_or(StorageError::MissingMeta {
                key: meta_keys::UPLOAD_HASH,
            })?;
        Ok(Self {
            command: packet.command.to_string(),
            upload_path: upload_path.to_string(),
            upload_hash: upload_hash.to_string(),
            uploaded_in: day.format(DATE_FORMAT).to_string(),
            file_name: packet.meta(meta_keys::FILE_NAME).map(str::to_string),
            sender_email: packet.sender.email.clone(),
        })
    }

    /// Whether replaying this entry copies a blob.
    pub fn is_upload(&self) -> bool {
        self.command == "upload"
    }
}

/// Per-day JSON array logs under a directory.
#[derive(Debug)]
pub struct TransferLog {
    dir: PathBuf,
    append_lock: Mutex<()>,
}

impl TransferLog {
    /// Log rooted at `dir` (created lazily on first append).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            append_lock: Mutex::new(()),
        }
    }

    /// Directory holding the day files.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the entries of `day`.
    pub fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.json", day.format(DATE_FORMAT)))
    }

    /// Append `entry` to the log of `day`.
    pub async fn append(&self, entry: &TransferLogEntry, day: NaiveDate) -> StorageResult<()> {
        let _guard = self.append_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.day_path(day);
        let mut entries = self.read_day(day).await?.unwrap_or_default();
        entries.push(entry.clone());
        let encoded = serde_json::to_vec_pretty(&entries)?;
        tokio::fs::write(&path, encoded).await?;
        debug!(path = %path.display(), entries = entries.len(), "transfer log appended");
        Ok(())
    }

    /// Entries of one day, or `None` when that day has no log file.
    pub async fn read_day(&self, day: NaiveDate) -> StorageResult<Option<Vec<TransferLogEntry>>> {
        match tokio::fs::read(self.day_path(day)).await {
            Ok(data) => Ok(Some(serde_json::from_slice(&data)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// All entries logged on days `start..=end`, in day order. Missing days are skipped.
    pub async fn load_gap_entries(&self, start: NaiveDate, end: NaiveDate) -> StorageResult<Vec<TransferLogEntry>> {
        let mut entries = Vec::new();
        for day in start.iter_days().take_while(|d| *d <= end) {
            match self.read_day(day).await? {
                Some(day_entries) => entries.extend(day_entries),
                None => debug!(day = %day, "no transfer log for day, skipping"),
            }
        }
        Ok(entries)
    }

    /// Entries logged from `start_span` (`YYYY-MM-DD`) through today.
    pub async fn load_gap_transfer_packets(&self, start_span: &str) -> StorageResult<Vec<TransferLogEntry>> {
        let start = parse_day(start_span)?;
        self.load_gap_entries(start, today()).await
    }

    /// Most recent day with a log file.
    pub async fn latest_day(&self) -> StorageResult<Option<NaiveDate>> {
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut latest: Option<NaiveDate> = None;
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(day) = parse_day(stem) {
                latest = Some(latest.map_or(day, |l| l.max(day)));
            }
        }
        Ok(latest)
    }
}
