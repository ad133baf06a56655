//! Transfer packet definitions and the binary codec.
//!
//! A [`TransferPacket`] is the request unit on every leg of the protocol (client to
//! coordinator, coordinator to replica, replica to replica). Packets are encoded with
//! bincode. Responses that carry raw blobs or archives are sent unwrapped.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::compress;
use crate::error::{Result, TransportError};

/// Well-known metadata keys carried in [`TransferPacket::meta`].
pub mod meta_keys {
    /// Original file name (client supplied).
    pub const FILE_NAME: &str = "FileName";
    /// Directory the file was uploaded from (client supplied).
    pub const DIR: &str = "Dir";
    /// Sharded directory under `uploads/` on a replica.
    pub const UPLOAD_PATH: &str = "UploadPath";
    /// Blob file name inside [`UPLOAD_PATH`].
    pub const UPLOAD_HASH: &str = "UploadHash";
    /// Timestamp the upload was accepted by the coordinator.
    pub const UPLOADED_IN: &str = "UploadedIn";
    /// Catalog file id.
    pub const FILE_ID: &str = "FileID";
    /// Catalog version id.
    pub const FILE_VERSION: &str = "FileVersion";
    /// Alternate spelling of [`FILE_VERSION`] accepted on download requests.
    pub const VERSION: &str = "Version";
    /// Sharded directory of a blob to download from a replica.
    pub const PATH: &str = "Path";
    /// Blob file name to download from a replica.
    pub const HASH: &str = "Hash";
    /// Node id a download was routed to.
    pub const STORAGE: &str = "Storage";
    /// First day (`YYYY-MM-DD`) of a bounded cacheup replay.
    pub const START_SPAN: &str = "StartSpan";
}

/// Command carried by a packet.
///
/// On the wire a command is its lowercase name. Names this build does not know decode to
/// [`Command::Unknown`] so dispatchers can log and ignore them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Command {
    /// Store a blob.
    Upload,
    /// Fetch a blob.
    Download,
    /// Stream an archive of stored blobs to a catching-up replica.
    CacheUp,
    /// Any other command name.
    Unknown(String),
}

impl Command {
    /// Wire name of the command.
    pub fn as_str(&self) -> &str {
        match self {
            Command::Upload => "upload",
            Command::Download => "download",
            Command::CacheUp => "cacheup",
            Command::Unknown(name) => name,
        }
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        match name.as_str() {
            "upload" => Command::Upload,
            "download" => Command::Download,
            "cacheup" => Command::CacheUp,
            _ => Command::Unknown(name),
        }
    }
}

impl From<Command> for String {
    fn from(command: Command) -> Self {
        command.as_str().to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of whoever built the packet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderMeta {
    /// Owning user's email.
    pub email: String,
    /// Device/agent name of the user.
    pub agent: String,
    /// Application that produced the packet (`client`, `server`, `storage`).
    pub application: String,
}

impl SenderMeta {
    /// Create a sender identity.
    pub fn new(email: &str, agent: &str, application: &str) -> Self {
        Self {
            email: email.to_string(),
            agent: agent.to_string(),
            application: application.to_string(),
        }
    }
}

/// One request on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferPacket {
    /// What the receiver should do.
    pub command: Command,
    /// String metadata; see [`meta_keys`].
    pub meta: HashMap<String, String>,
    /// Compressed file bytes, absent for control requests.
    #[serde(with = "serde_bytes")]
    pub compressed_payload: Option<Vec<u8>>,
    /// Sender identity.
    pub sender: SenderMeta,
}

impl TransferPacket {
    /// Create a packet without payload or metadata.
    pub fn new(command: Command, sender: SenderMeta) -> Self {
        Self {
            command,
            meta: HashMap::new(),
            compressed_payload: None,
            sender,
        }
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.meta.insert(key.to_string(), value.into());
        self
    }

    /// Look up a metadata value.
    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Read a file, compress it into the payload and record `FileName`/`Dir`.
    pub fn from_file(path: &Path, sender: SenderMeta) -> Result<Self> {
        let data = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dir = path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self::from_bytes(&file_name, &dir, &data, sender)
    }

    /// Compress in-memory file content into an upload packet.
    pub fn from_bytes(file_name: &str, dir: &str, data: &[u8], sender: SenderMeta) -> Result<Self> {
        let compressed = compress::compress_payload(data, compress::DEFAULT_LEVEL)?;
        let mut packet = Self::new(Command::Upload, sender)
            .with_meta(meta_keys::FILE_NAME, file_name)
            .with_meta(meta_keys::DIR, dir);
        packet.compressed_payload = Some(compressed);
        Ok(packet)
    }

    /// Decompress the payload back to the original file bytes.
    pub fn decompress_payload(&self) -> Result<Vec<u8>> {
        match &self.compressed_payload {
            Some(data) => compress::decompress_payload(data),
            None => Ok(Vec::new()),
        }
    }

    /// Copy of this packet with the payload removed, for logging.
    pub fn without_payload(&self) -> Self {
        Self {
            command: self.command.clone(),
            meta: self.meta.clone(),
            compressed_payload: None,
            sender: self.sender.clone(),
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| TransportError::Encode(e.to_string()))
    }

    /// Parse wire bytes. A failure is a protocol violation.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| TransportError::Decode(e.to_string()))
    }
}
