//! Catch-up of a replica from its predecessor.
//!
//! When a membership snapshot shows this node together with a member whose index is one
//! lower, the node asks that predecessor for a cacheup archive and unpacks it into its own
//! `uploads/`. A node that booted with transfer-log history asks only for the days since
//! its latest log day at boot; a node that booted empty asks for everything, even if
//! fan-out uploads reach it before its first snapshot. Each predecessor is caught up from
//! at most once.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::NaiveDate;
use parking_lot::Mutex;
use replistore_storage::archive::{extract_archive_async, ExtractStats};
use replistore_storage::transfer_log::DATE_FORMAT;
use replistore_storage::StorageNodeService;
use replistore_transport::protocol::meta_keys;
use replistore_transport::{Command, SenderMeta, TcpTransport, TransferPacket};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::membership::{MemberSnapshot, StorageNode};

/// What to ask the predecessor for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchUpMode {
    /// The whole `uploads/` tree.
    Full,
    /// Blobs logged from this day through today.
    Since(NaiveDate),
}

/// A finished catch-up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpOutcome {
    /// Predecessor the archive came from.
    pub predecessor: String,
    /// What was requested.
    pub mode: CatchUpMode,
    /// What was unpacked.
    pub stats: ExtractStats,
}

/// The member directly before `node_id` in index order, if any.
pub fn predecessor_of<'a>(snapshot: &'a MemberSnapshot, node_id: &str) -> Option<&'a StorageNode> {
    let me = snapshot.get(node_id)?;
    if snapshot.len() < 2 || me.index <= 1 {
        return None;
    }
    snapshot.values().find(|node| node.index == me.index - 1)
}

/// Catch-up driver of one replica.
pub struct CatchUp {
    service: Arc<StorageNodeService>,
    transport: TcpTransport,
    peer_host: String,
    resume_from: Option<NaiveDate>,
    caught_up_from: Mutex<HashSet<String>>,
}

impl CatchUp {
    /// Driver restoring into `service`'s data directory, dialing peers on `peer_host`.
    ///
    /// `resume_from` is the latest transfer-log day the node had when it booted; `None`
    /// means it starts empty.
    pub fn new(
        service: Arc<StorageNodeService>,
        transport: TcpTransport,
        peer_host: impl Into<String>,
        resume_from: Option<NaiveDate>,
    ) -> Self {
        Self {
            service,
            transport,
            peer_host: peer_host.into(),
            resume_from,
            caught_up_from: Mutex::new(HashSet::new()),
        }
    }

    /// Driver whose mode is fixed by the transfer log as it is right now.
    ///
    /// Must run before the node announces itself, so uploads fanned out to it afterwards
    /// cannot turn a first join into a gap replay.
    pub async fn open(
        service: Arc<StorageNodeService>,
        transport: TcpTransport,
        peer_host: impl Into<String>,
    ) -> Result<Self> {
        let resume_from = service.log().latest_day().await?;
        Ok(Self::new(service, transport, peer_host, resume_from))
    }

    /// Full on first join, bounded by the latest log day at boot otherwise.
    pub fn mode(&self) -> CatchUpMode {
        match self.resume_from {
            Some(day) => CatchUpMode::Since(day),
            None => CatchUpMode::Full,
        }
    }

    /// React to a membership snapshot. Returns `None` when there is nothing to do.
    pub async fn on_snapshot(&self, snapshot: &MemberSnapshot) -> Result<Option<CatchUpOutcome>> {
        let node_id = self.service.node_id();
        let Some(predecessor) = predecessor_of(snapshot, node_id) else {
            debug!(node_id, members = snapshot.len(), "no predecessor, nothing to restore");
            return Ok(None);
        };
        if self.caught_up_from.lock().contains(&predecessor.id) {
            return Ok(None);
        }

        let mode = self.mode();
        info!(node_id, predecessor = %predecessor.id, ?mode, "catch-up started");
        let outcome = match self.pull(predecessor, mode).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(node_id, predecessor = %predecessor.id, error = %e, "catch-up failed");
                return Err(e);
            }
        };
        self.caught_up_from.lock().insert(predecessor.id.clone());
        info!(
            node_id,
            predecessor = %predecessor.id,
            files = outcome.stats.files,
            bytes = outcome.stats.bytes,
            "catch-up finished"
        );
        Ok(Some(outcome))
    }

    /// Request an archive from `predecessor` and unpack it into `uploads/`.
    pub async fn pull(&self, predecessor: &StorageNode, mode: CatchUpMode) -> Result<CatchUpOutcome> {
        let sender = SenderMeta::new("", self.service.node_id(), "storage");
        let mut request = TransferPacket::new(Command::CacheUp, sender);
        if let CatchUpMode::Since(day) = mode {
            request = request.with_meta(meta_keys::START_SPAN, day.format(DATE_FORMAT).to_string());
        }
        let addr = format!("{}:{}", self.peer_host, predecessor.port);
        let archive = self.transport.request(&addr, &request.encode()?).await?;
        let stats = extract_archive_async(archive, self.service.store().uploads_dir()).await?;
        Ok(CatchUpOutcome {
            predecessor: predecessor.id.clone(),
            mode,
            stats,
        })
    }
}
