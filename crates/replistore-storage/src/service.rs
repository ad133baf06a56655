//! Command service of one storage replica.
//!
//! Each accepted connection carries exactly one framed [`TransferPacket`]. The service
//! decodes it and dispatches on the command:
//!
//! - `upload` stores the compressed payload at `uploads/<UploadPath>/<UploadHash>`, logs
//!   the transfer for today and answers with a framed [`UploadStatus`].
//! - `download` answers with the raw blob at `uploads/<Path>/<Hash>`.
//! - `cacheup` answers with a zip of the whole `uploads/` tree, or, when `StartSpan` is
//!   set, with a zip of only the blobs logged from that day through today.
//!
//! Any failure ends the connection without a response frame; the caller sees the
//! stream close.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::NaiveDate;
use replistore_transport::protocol::meta_keys;
use replistore_transport::tcp::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use replistore_transport::{Command, ConnectionHandler, TransferPacket, TransportError};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::archive;
use crate::blob_store::BlobStore;
use crate::error::{StorageError, StorageResult};
use crate::transfer_log::{self, TransferLog, TransferLogEntry, DATE_FORMAT};

/// Reply of a replica to an `upload` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadStatus {
    /// The blob is on disk and logged.
    Stored,
    /// The upload did not complete.
    Failed {
        /// Human-readable cause.
        reason: String,
    },
}

impl UploadStatus {
    /// Serialize for the wire.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TransportError::Encode(e.to_string()).into())
    }

    /// Deserialize from the wire.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Decode(e.to_string()).into())
    }
}

/// Upload, download and cacheup handling for one replica's data directory.
#[derive(Debug)]
pub struct StorageNodeService {
    node_id: String,
    store: BlobStore,
    log: TransferLog,
    max_frame_bytes: u64,
}

impl StorageNodeService {
    /// Open the replica's storage layout under `data_dir`.
    pub async fn open(node_id: impl Into<String>, data_dir: impl Into<PathBuf>) -> StorageResult<Self> {
        let store = BlobStore::open(data_dir).await?;
        let log = TransferLog::new(store.logs_dir());
        Ok(Self {
            node_id: node_id.into(),
            store,
            log,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        })
    }

    /// Override the largest accepted request frame.
    pub fn with_max_frame_bytes(mut self, max_frame_bytes: u64) -> Self {
        self.max_frame_bytes = max_frame_bytes;
        self
    }

    /// Id of the replica this service belongs to.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The underlying blob store.
    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    /// The replica's transfer log.
    pub fn log(&self) -> &TransferLog {
        &self.log
    }

    /// Store an uploaded blob and log it for today.
    ///
    /// A log failure is reported but the written blob stays in place.
    pub async fn handle_upload(&self, packet: &TransferPacket) -> StorageResult<PathBuf> {
        let upload_path = require(packet, meta_keys::UPLOAD_PATH)?;
        let upload_hash = require(packet, meta_keys::UPLOAD_HASH)?;
        let payload = packet
            .compressed_payload
            .as_deref()
            .ok_or(StorageError::MissingPayload)?;

        let path = self.store.write_blob(upload_path, upload_hash, payload).await?;

        let day = transfer_log::today();
        let entry = TransferLogEntry::from_packet(&packet.without_payload(), day)?;
        if let Err(e) = self.log.append(&entry, day).await {
            warn!(node_id = %self.node_id, path = %path.display(), error = %e, "blob stored but transfer log append failed");
            return Err(e);
        }
        info!(node_id = %self.node_id, upload_path, upload_hash, bytes = payload.len(), "blob stored");
        Ok(path)
    }

    /// Raw bytes of the blob named by `Path`/`Hash`.
    pub async fn handle_download(&self, packet: &TransferPacket) -> StorageResult<Vec<u8>> {
        let path = require(packet, meta_keys::PATH)?;
        let hash = require(packet, meta_keys::HASH)?;
        self.store.read_blob(path, hash).await
    }

    /// Archive for a catching-up replica, full or bounded by `StartSpan`.
    pub async fn handle_cacheup(&self, packet: &TransferPacket) -> StorageResult<Vec<u8>> {
        match packet.meta(meta_keys::START_SPAN) {
            None => self.full_snapshot().await,
            Some(span) => {
                let start = transfer_log::parse_day(span)?;
                self.gap_snapshot(start, transfer_log::today()).await
            }
        }
    }

    /// Zip of the entire `uploads/` tree.
    pub async fn full_snapshot(&self) -> StorageResult<Vec<u8>> {
        let bytes = archive::archive_dir_async(self.store.uploads_dir()).await?;
        info!(node_id = %self.node_id, bytes = bytes.len(), "full snapshot built");
        Ok(bytes)
    }

    /// Zip of the blobs logged on days `start..=end`.
    ///
    /// Blobs are copied into a scratch directory under `backups/` that is removed when
    /// this returns, whether or not archiving succeeded. Entries whose blob is gone are
    /// skipped.
    pub async fn gap_snapshot(&self, start: NaiveDate, end: NaiveDate) -> StorageResult<Vec<u8>> {
        let entries = self.log.load_gap_entries(start, end).await?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-{}-", self.node_id, start.format(DATE_FORMAT)))
            .suffix("-backups")
            .tempdir_in(self.store.backups_dir())?;

        let mut copied = 0usize;
        for entry in entries.iter().filter(|e| e.is_upload()) {
            match self
                .store
                .copy_blob_into(&entry.upload_path, &entry.upload_hash, scratch.path())
                .await
            {
                Ok(_) => copied += 1,
                Err(StorageError::BlobNotFound { path }) => {
                    warn!(node_id = %self.node_id, path = %path.display(), "logged blob missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }

        let bytes = archive::archive_dir_async(scratch.path().to_path_buf()).await?;
        info!(
            node_id = %self.node_id,
            start = %start,
            end = %end,
            entries = entries.len(),
            copied,
            bytes = bytes.len(),
            "gap snapshot built"
        );
        Ok(bytes)
    }

    /// Root of the replica's data directory.
    pub fn data_dir(&self) -> &Path {
        self.store.root()
    }
}

fn require<'a>(packet: &'a TransferPacket, key: &'static str) -> StorageResult<&'a str> {
    packet.meta(key).ok_or(StorageError::MissingMeta { key })
}

#[async_trait]
impl ConnectionHandler for StorageNodeService {
    type Error = StorageError;

    async fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> StorageResult<()> {
        let frame = read_frame(stream, self.max_frame_bytes).await?;
        let packet = TransferPacket::decode(&frame)?;
        debug!(node_id = %self.node_id, peer = %peer, command = %packet.command, "request decoded");

        match &packet.command {
            Command::Upload => match self.handle_upload(&packet).await {
                Ok(_) => write_frame(stream, &UploadStatus::Stored.encode()?).await?,
                Err(e) => {
                    let status = UploadStatus::Failed {
                        reason: e.to_string(),
                    };
                    write_frame(stream, &status.encode()?).await?;
                    return Err(e);
                }
            },
            Command::Download => {
                let data = self.handle_download(&packet).await?;
                write_frame(stream, &data).await?;
            }
            Command::CacheUp => {
                let data = self.handle_cacheup(&packet).await?;
                write_frame(stream, &data).await?;
            }
            Command::Unknown(name) => {
                debug!(node_id = %self.node_id, command = %name, "ignoring unknown command");
            }
        }
        Ok(())
    }
}
