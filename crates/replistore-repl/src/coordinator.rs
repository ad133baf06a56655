//! Replication coordinator: the client-facing side of the server.
//!
//! Uploads are addressed, recorded in the catalog and fanned out to every current member.
//! The client gets an [`UploadReceipt`] once all sends have finished, whatever their
//! outcome; only acknowledged replicas are added to the version's storages. Downloads go
//! to the first replica in the version's storages that is still a member, and the blob is
//! relayed back unchanged.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use replistore_storage::address::{upload_address, version_hash};
use replistore_transport::protocol::meta_keys;
use replistore_transport::tcp::{read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES};
use replistore_transport::{Command, ConnectionHandler, TcpTransport, TransferPacket};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, FileLookup};
use crate::config::ServerConfig;
use crate::error::{ReplError, Result};
use crate::fanout::{FanoutSender, FanoutSummary, FanoutTarget};
use crate::registry::Registry;

/// Reply to a client upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    /// Catalog file id.
    pub file_id: String,
    /// Catalog version id.
    pub version_id: String,
    /// Blob name of the version on the replicas.
    pub content_hash: String,
}

impl UploadReceipt {
    /// Serialize for the wire.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from the wire.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Routes client uploads and downloads across the registered replicas.
pub struct Coordinator {
    registry: Arc<Registry>,
    catalog: Arc<dyn Catalog>,
    fanout: FanoutSender,
    transport: TcpTransport,
    replica_host: String,
    max_frame_bytes: u64,
}

impl Coordinator {
    /// Create a coordinator over `registry` and `catalog`.
    pub fn new(registry: Arc<Registry>, catalog: Arc<dyn Catalog>, config: &ServerConfig) -> Self {
        let transport = config.transport();
        Self {
            registry,
            catalog,
            fanout: FanoutSender::new(transport.clone()),
            transport,
            replica_host: config.replica_host.clone(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// The registry uploads are fanned out over.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The catalog uploads are recorded in.
    pub fn catalog(&self) -> &Arc<dyn Catalog> {
        &self.catalog
    }

    fn replica_addr(&self, port: u16) -> String {
        format!("{}:{}", self.replica_host, port)
    }

    /// Address, record and replicate one upload.
    pub async fn upload(&self, packet: TransferPacket) -> Result<(UploadReceipt, FanoutSummary)> {
        let email = packet.sender.email.clone();
        if email.is_empty() {
            return Err(ReplError::MissingSender);
        }
        let name = packet
            .meta(meta_keys::FILE_NAME)
            .ok_or(ReplError::MissingMeta {
                key: meta_keys::FILE_NAME,
            })?
            .to_string();
        let dir = packet.meta(meta_keys::DIR).unwrap_or_default().to_string();

        let now = Utc::now();
        let address = upload_address(&email, &dir, &name);
        let content_hash = version_hash(&address, now);
        let (file_id, version) = self
            .catalog
            .record_upload(&email, &name, &dir, &content_hash, now)
            .await?;

        let packet = packet
            .with_meta(meta_keys::UPLOAD_PATH, address.sharded_path.clone())
            .with_meta(meta_keys::UPLOAD_HASH, content_hash.clone())
            .with_meta(meta_keys::UPLOADED_IN, now.to_rfc3339())
            .with_meta(meta_keys::FILE_ID, file_id.clone())
            .with_meta(meta_keys::FILE_VERSION, version.id.clone());
        let payload = Arc::new(packet.encode()?);

        let targets: Vec<FanoutTarget> = self
            .registry
            .snapshot()
            .await
            .into_values()
            .map(|node| FanoutTarget {
                addr: self.replica_addr(node.port),
                node_id: node.id,
            })
            .collect();
        let summary = self.fanout.fanout(payload, targets).await;

        for result in &summary.results {
            if result.success {
                if let Err(e) = self
                    .catalog
                    .add_storage(&email, &file_id, &version.id, &result.node_id)
                    .await
                {
                    warn!(node_id = %result.node_id, file_id = %file_id, error = %e, "failed to record replica");
                }
            } else {
                warn!(
                    node_id = %result.node_id,
                    file_id = %file_id,
                    error = result.error.as_deref().unwrap_or_default(),
                    "replica did not store upload"
                );
            }
        }
        if summary.any_failed() {
            warn!(
                user = %email,
                file_id = %file_id,
                version_id = %version.id,
                replicas = summary.successful,
                targets = summary.total_targets,
                "upload partially replicated"
            );
        } else {
            info!(
                user = %email,
                file_id = %file_id,
                version_id = %version.id,
                replicas = summary.successful,
                targets = summary.total_targets,
                "upload replicated"
            );
        }

        let receipt = UploadReceipt {
            file_id,
            version_id: version.id,
            content_hash,
        };
        Ok((receipt, summary))
    }

    /// Fetch a stored blob from a live replica that holds it.
    pub async fn download(&self, packet: &TransferPacket) -> Result<Vec<u8>> {
        let email = packet.sender.email.as_str();
        if email.is_empty() {
            return Err(ReplError::MissingSender);
        }
        let lookup = match packet.meta(meta_keys::FILE_ID) {
            Some(id) => FileLookup::Id(id.to_string()),
            None => FileLookup::Name {
                name: packet
                    .meta(meta_keys::FILE_NAME)
                    .ok_or(ReplError::MissingMeta {
                        key: meta_keys::FILE_ID,
                    })?
                    .to_string(),
                path: packet.meta(meta_keys::DIR).unwrap_or_default().to_string(),
            },
        };
        let version_id = packet
            .meta(meta_keys::FILE_VERSION)
            .or_else(|| packet.meta(meta_keys::VERSION));
        let (record, version) = self.catalog.resolve_version(email, &lookup, version_id).await?;

        let members = self.registry.snapshot().await;
        let holder = version
            .storages
            .iter()
            .find_map(|id| members.get(id))
            .ok_or_else(|| ReplError::NoLiveHolder {
                version_id: version.id.clone(),
            })?;

        let address = upload_address(email, &record.path, &record.name);
        let request = TransferPacket::new(Command::Download, packet.sender.clone())
            .with_meta(meta_keys::PATH, address.sharded_path)
            .with_meta(meta_keys::HASH, version.content_hash.clone())
            .with_meta(meta_keys::STORAGE, holder.id.clone());
        let blob = self
            .transport
            .request(&self.replica_addr(holder.port), &request.encode()?)
            .await?;
        debug!(node_id = %holder.id, version_id = %version.id, bytes = blob.len(), "download served");
        Ok(blob)
    }
}

#[async_trait]
impl ConnectionHandler for Coordinator {
    type Error = ReplError;

    async fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<()> {
        let frame = read_frame(stream, self.max_frame_bytes).await?;
        let packet = TransferPacket::decode(&frame)?;
        debug!(peer = %peer, command = %packet.command, user = %packet.sender.email, "client request");

        match packet.command {
            Command::Upload => {
                let (receipt, _) = self.upload(packet).await?;
                write_frame(stream, &receipt.encode()?).await?;
            }
            Command::Download => {
                let blob = self.download(&packet).await?;
                write_frame(stream, &blob).await?;
            }
            Command::CacheUp | Command::Unknown(_) => {
                debug!(peer = %peer, command = %packet.command, "ignoring command");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::membership::{MembershipEvent, MemoryBus};
    use crate::registry::RegistryConfig;
    use replistore_storage::StorageNodeService;
    use replistore_transport::{serve, SenderMeta};
    use tokio::sync::watch;

    struct Fixture {
        coordinator: Coordinator,
        catalog: Arc<MemoryCatalog>,
        registry: Arc<Registry>,
        _dirs: Vec<tempfile::TempDir>,
        _shutdown: watch::Sender<bool>,
    }

    async fn fixture(replicas: &[&str]) -> Fixture {
        let bus = Arc::new(MemoryBus::new());
        let registry = Arc::new(Registry::new(bus, RegistryConfig::default()));
        let catalog = Arc::new(MemoryCatalog::new());
        let (tx, rx) = watch::channel(false);
        let mut dirs = Vec::new();
        for id in replicas {
            let dir = tempfile::tempdir().unwrap();
            let service = Arc::new(StorageNodeService::open(*id, dir.path()).await.unwrap());
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            tokio::spawn(serve(listener, service, rx.clone()));
            registry.join(&MembershipEvent::new(*id, port)).await.unwrap();
            dirs.push(dir);
        }
        let coordinator = Coordinator::new(registry.clone(), catalog.clone(), &ServerConfig::default());
        Fixture {
            coordinator,
            catalog,
            registry,
            _dirs: dirs,
            _shutdown: tx,
        }
    }

    fn upload_packet(data: &[u8]) -> TransferPacket {
        TransferPacket::from_bytes("report.pdf", "/docs", data, SenderMeta::new("a@x.com", "laptop", "client")).unwrap()
    }

    #[tokio::test]
    async fn test_upload_records_every_acknowledging_replica() {
        let fx = fixture(&["r1", "r2"]).await;
        let (receipt, summary) = fx.coordinator.upload(upload_packet(b"v1")).await.unwrap();
        assert!(summary.all_succeeded());

        let files = fx.catalog.list_files("a@x.com").await.unwrap();
        let version = files[0].version(&receipt.version_id).unwrap();
        assert_eq!(version.content_hash, receipt.content_hash);
        assert_eq!(version.storages.iter().collect::<Vec<_>>(), vec!["r1", "r2"]);
    }

    #[tokio::test]
    async fn test_unreachable_replica_is_left_out_silently() {
        let fx = fixture(&["r1"]).await;
        fx.registry.join(&MembershipEvent::new("ghost", 1)).await.unwrap();

        let (receipt, summary) = fx.coordinator.upload(upload_packet(b"v1")).await.unwrap();
        assert_eq!(summary.failed_node_ids(), vec!["ghost"]);
        let files = fx.catalog.list_files("a@x.com").await.unwrap();
        let version = files[0].version(&receipt.version_id).unwrap();
        assert_eq!(version.storages.iter().collect::<Vec<_>>(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_upload_without_members_still_records_version() {
        let fx = fixture(&[]).await;
        let (receipt, summary) = fx.coordinator.upload(upload_packet(b"v1")).await.unwrap();
        assert_eq!(summary.total_targets, 0);
        let err = fx
            .coordinator
            .download(
                &TransferPacket::new(Command::Download, SenderMeta::new("a@x.com", "", "client"))
                    .with_meta(meta_keys::FILE_ID, receipt.file_id),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReplError::NoLiveHolder { .. }));
    }

    #[tokio::test]
    async fn test_download_latest_and_explicit_version() {
        let fx = fixture(&["r1"]).await;
        let (first, _) = fx.coordinator.upload(upload_packet(b"first")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        let (second, _) = fx.coordinator.upload(upload_packet(b"second")).await.unwrap();
        assert_eq!(first.file_id, second.file_id);
        assert_ne!(first.content_hash, second.content_hash);

        let sender = SenderMeta::new("a@x.com", "laptop", "client");
        let latest = fx
            .coordinator
            .download(
                &TransferPacket::new(Command::Download, sender.clone())
                    .with_meta(meta_keys::FILE_NAME, "report.pdf")
                    .with_meta(meta_keys::DIR, "/docs"),
            )
            .await
            .unwrap();
        assert_eq!(replistore_transport::compress::decompress_payload(&latest).unwrap(), b"second");

        let older = fx
            .coordinator
            .download(
                &TransferPacket::new(Command::Download, sender)
                    .with_meta(meta_keys::FILE_ID, first.file_id)
                    .with_meta(meta_keys::VERSION, first.version_id),
            )
            .await
            .unwrap();
        assert_eq!(replistore_transport::compress::decompress_payload(&older).unwrap(), b"first");
    }

    #[tokio::test]
    async fn test_download_skips_holders_that_left() {
        let fx = fixture(&["r1", "r2"]).await;
        let (receipt, _) = fx.coordinator.upload(upload_packet(b"data")).await.unwrap();
        fx.registry.leave("r1").await.unwrap();

        let blob = fx
            .coordinator
            .download(
                &TransferPacket::new(Command::Download, SenderMeta::new("a@x.com", "", "client"))
                    .with_meta(meta_keys::FILE_ID, receipt.file_id),
            )
            .await
            .unwrap();
        assert_eq!(replistore_transport::compress::decompress_payload(&blob).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_requests_need_an_owner_and_file_name() {
        let fx = fixture(&[]).await;
        let anonymous = upload_packet(b"x");
        let anonymous = TransferPacket {
            sender: SenderMeta::default(),
            ..anonymous
        };
        assert!(matches!(fx.coordinator.upload(anonymous).await, Err(ReplError::MissingSender)));

        let unnamed = TransferPacket::new(Command::Upload, SenderMeta::new("a@x.com", "", "client"));
        assert!(matches!(
            fx.coordinator.upload(unnamed).await,
            Err(ReplError::MissingMeta { key: "FileName" })
        ));
    }
}
