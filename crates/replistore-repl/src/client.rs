//! Library client speaking the wire protocol to a coordinator.

use std::path::Path;

use replistore_transport::compress::decompress_payload;
use replistore_transport::protocol::meta_keys;
use replistore_transport::{Command, SenderMeta, TcpTransport, TransferPacket};
use tracing::debug;

use crate::coordinator::UploadReceipt;
use crate::error::Result;

/// Uploads and downloads files as one user.
#[derive(Debug, Clone)]
pub struct Client {
    server_addr: String,
    sender: SenderMeta,
    transport: TcpTransport,
}

impl Client {
    /// Client for the coordinator at `server_addr`.
    pub fn new(server_addr: impl Into<String>, sender: SenderMeta) -> Self {
        Self {
            server_addr: server_addr.into(),
            sender,
            transport: TcpTransport::default(),
        }
    }

    /// Upload a file from disk.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadReceipt> {
        let packet = TransferPacket::from_file(path, self.sender.clone())?;
        self.send_upload(packet).await
    }

    /// Upload in-memory content as `dir/file_name`.
    pub async fn upload_bytes(&self, file_name: &str, dir: &str, data: &[u8]) -> Result<UploadReceipt> {
        let packet = TransferPacket::from_bytes(file_name, dir, data, self.sender.clone())?;
        self.send_upload(packet).await
    }

    async fn send_upload(&self, packet: TransferPacket) -> Result<UploadReceipt> {
        let reply = self.transport.request(&self.server_addr, &packet.encode()?).await?;
        let receipt = UploadReceipt::decode(&reply)?;
        debug!(file_id = %receipt.file_id, version_id = %receipt.version_id, "upload acknowledged");
        Ok(receipt)
    }

    /// Download a file by id; the latest version unless `version_id` is given.
    pub async fn download(&self, file_id: &str, version_id: Option<&str>) -> Result<Vec<u8>> {
        let mut packet = TransferPacket::new(Command::Download, self.sender.clone())
            .with_meta(meta_keys::FILE_ID, file_id);
        if let Some(version_id) = version_id {
            packet = packet.with_meta(meta_keys::FILE_VERSION, version_id);
        }
        self.fetch(packet).await
    }

    /// Download the latest version of `dir/file_name`.
    pub async fn download_by_name(&self, file_name: &str, dir: &str) -> Result<Vec<u8>> {
        let packet = TransferPacket::new(Command::Download, self.sender.clone())
            .with_meta(meta_keys::FILE_NAME, file_name)
            .with_meta(meta_keys::DIR, dir);
        self.fetch(packet).await
    }

    async fn fetch(&self, packet: TransferPacket) -> Result<Vec<u8>> {
        let blob = self.transport.request(&self.server_addr, &packet.encode()?).await?;
        Ok(decompress_payload(&blob)?)
    }
}
