//! Membership bus: the shared store replicas and the registry talk through.
//!
//! Four facilities, all behind [`MembershipBus`]:
//!
//! - durable streams with consumer groups for join and leave events. Entries are handed
//!   out again on every read until acknowledged, and acknowledging deletes them.
//! - pub/sub channels for membership snapshots (`storage-update`) and per-node
//!   health checks (`<id>-health`, carrying `"ping"`/`"pong"`).
//! - a durable alive-set mapping node ids to their port and index, used to reseed the
//!   registry after a coordinator restart.
//!
//! [`MemoryBus`] implements all of it in process.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use tracing::trace;

use crate::error::Result;

/// Stream of join events.
pub const JOIN_STREAM: &str = "storage-stream";
/// Stream of leave events.
pub const LEAVE_STREAM: &str = "disconnect-stream";
/// Consumer group the registry reads both streams with.
pub const REGISTRY_GROUP: &str = "registry";
/// Channel carrying the serialized member map after every change.
pub const UPDATE_CHANNEL: &str = "storage-update";
/// Health request payload.
pub const PING: &str = "ping";
/// Health reply payload.
pub const PONG: &str = "pong";

const CHANNEL_CAPACITY: usize = 64;

/// Health channel of one node.
pub fn health_channel(node_id: &str) -> String {
    format!("{node_id}-health")
}

/// A registered replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageNode {
    /// Opaque node id.
    pub id: String,
    /// Join order, starting at 1; the predecessor of `n` is the member with index `n - 1`.
    pub index: u64,
    /// Port the replica's command service listens on.
    pub port: u16,
    /// Last time the node joined or answered a health check.
    pub last_seen: DateTime<Utc>,
}

/// Full member map as broadcast on [`UPDATE_CHANNEL`].
pub type MemberSnapshot = BTreeMap<String, StorageNode>;

/// Serialize a snapshot for broadcast.
pub fn encode_snapshot(snapshot: &MemberSnapshot) -> Result<String> {
    Ok(serde_json::to_string(snapshot)?)
}

/// Parse a broadcast snapshot.
pub fn decode_snapshot(message: &str) -> Result<MemberSnapshot> {
    Ok(serde_json::from_str(message)?)
}

/// Join or leave event published by a replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEvent {
    /// Node id.
    #[serde(rename = "ID")]
    pub id: String,
    /// Command service port.
    #[serde(rename = "Port")]
    pub port: u16,
}

impl MembershipEvent {
    /// Create an event.
    pub fn new(id: impl Into<String>, port: u16) -> Self {
        Self { id: id.into(), port }
    }
}

/// One entry read from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry id, used to acknowledge it.
    pub id: u64,
    /// The event.
    pub event: MembershipEvent,
    /// How many times this entry has been handed out, including this read.
    pub deliveries: u32,
}

/// Durable per-node record in the alive-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Command service port.
    pub port: u16,
    /// Registry index.
    pub index: u64,
}

/// Shared store used for replica membership.
#[async_trait]
pub trait MembershipBus: Send + Sync + 'static {
    /// Append an event to a stream and return its entry id.
    async fn produce(&self, stream: &str, event: MembershipEvent) -> Result<u64>;

    /// Read unacknowledged entries, waiting up to `block` when there are none.
    async fn read_group(&self, stream: &str, group: &str, consumer: &str, block: Duration) -> Result<Vec<StreamEntry>>;

    /// Acknowledge and delete an entry.
    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()>;

    /// Publish a message; returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>>;

    /// Record a node in the alive-set.
    async fn mark_alive(&self, node_id: &str, record: NodeRecord) -> Result<()>;

    /// Remove a node from the alive-set.
    async fn mark_dead(&self, node_id: &str) -> Result<()>;

    /// Every node in the alive-set.
    async fn alive_members(&self) -> Result<Vec<(String, NodeRecord)>>;
}

#[derive(Debug, Default)]
struct StreamState {
    next_id: u64,
    entries: BTreeMap<u64, (MembershipEvent, u32)>,
}

/// In-process [`MembershipBus`].
#[derive(Debug, Default)]
pub struct MemoryBus {
    streams: Mutex<HashMap<String, StreamState>>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    alive: Mutex<BTreeMap<String, NodeRecord>>,
    produced: Notify,
}

impl MemoryBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unacknowledged entries in a stream.
    pub fn pending(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn take_pending(&self, stream: &str) -> Vec<StreamEntry> {
        let mut streams = self.streams.lock();
        let Some(state) = streams.get_mut(stream) else {
            return Vec::new();
        };
        state
            .entries
            .iter_mut()
            .map(|(id, (event, deliveries))| {
                *deliveries += 1;
                StreamEntry {
                    id: *id,
                    event: event.clone(),
                    deliveries: *deliveries,
                }
            })
            .collect()
    }
}

#[async_trait]
impl MembershipBus for MemoryBus {
    async fn produce(&self, stream: &str, event: MembershipEvent) -> Result<u64> {
        let id = {
            let mut streams = self.streams.lock();
            let state = streams.entry(stream.to_string()).or_default();
            state.next_id += 1;
            state.entries.insert(state.next_id, (event, 0));
            state.next_id
        };
        self.produced.notify_waiters();
        trace!(stream, id, "stream entry produced");
        Ok(id)
    }

    async fn read_group(&self, stream: &str, group: &str, consumer: &str, block: Duration) -> Result<Vec<StreamEntry>> {
        let notified = self.produced.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let entries = self.take_pending(stream);
        if !entries.is_empty() {
            trace!(stream, group, consumer, count = entries.len(), "stream entries delivered");
            return Ok(entries);
        }
        let _ = tokio::time::timeout(block, notified).await;
        Ok(self.take_pending(stream))
    }

    async fn ack(&self, stream: &str, group: &str, id: u64) -> Result<()> {
        if let Some(state) = self.streams.lock().get_mut(stream) {
            state.entries.remove(&id);
        }
        trace!(stream, group, id, "stream entry acknowledged");
        Ok(())
    }

    async fn publish(&self, channel: &str, message: String) -> Result<usize> {
        let sender = self.channels.lock().get(channel).cloned();
        Ok(sender.and_then(|tx| tx.send(message).ok()).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        let mut channels = self.channels.lock();
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn mark_alive(&self, node_id: &str, record: NodeRecord) -> Result<()> {
        self.alive.lock().insert(node_id.to_string(), record);
        Ok(())
    }

    async fn mark_dead(&self, node_id: &str) -> Result<()> {
        self.alive.lock().remove(node_id);
        Ok(())
    }

    async fn alive_members(&self) -> Result<Vec<(String, NodeRecord)>> {
        Ok(self
            .alive
            .lock()
            .iter()
            .map(|(id, record)| (id.clone(), *record))
            .collect())
    }
}
