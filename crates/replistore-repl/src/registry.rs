//! Server-side replica registry.
//!
//! The member map lives behind one async mutex and is only reachable through
//! [`Registry`] methods. Three background loops drive it: the join loop and the leave
//! loop consume the membership streams, and the health sweep pings members that have
//! gone quiet and evicts the ones that do not answer in time. Every change to the map is
//! followed by a snapshot broadcast on the update channel.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::membership::{
    encode_snapshot, health_channel, MemberSnapshot, MembershipBus, MembershipEvent, NodeRecord,
    StorageNode, JOIN_STREAM, LEAVE_STREAM, PING, PONG, REGISTRY_GROUP, UPDATE_CHANNEL,
};

const STREAM_BLOCK: Duration = Duration::from_millis(250);
const BUS_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Registry timing and eviction policy.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Time between health sweeps.
    pub health_check_interval: Duration,
    /// Members not seen for this long are pinged.
    pub stale_after: Duration,
    /// How long to wait for a pong.
    pub health_check_timeout: Duration,
    /// Whether eviction also clears the node from the durable alive-set.
    pub purge_durable_on_evict: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(300),
            stale_after: Duration::from_secs(600),
            health_check_timeout: Duration::from_secs(5),
            purge_durable_on_evict: true,
        }
    }
}

/// Outcome of one health sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Members that were pinged.
    pub checked: usize,
    /// Members that answered and had `last_seen` refreshed.
    pub refreshed: Vec<String>,
    /// Members evicted for not answering.
    pub evicted: Vec<String>,
}

#[derive(Debug)]
struct Members {
    nodes: BTreeMap<String, StorageNode>,
    next_index: u64,
}

/// In-memory member table backed by a [`MembershipBus`].
pub struct Registry {
    members: Mutex<Members>,
    bus: Arc<dyn MembershipBus>,
    config: RegistryConfig,
    consumer: String,
}

impl Registry {
    /// Create an empty registry.
    pub fn new(bus: Arc<dyn MembershipBus>, config: RegistryConfig) -> Self {
        Self {
            members: Mutex::new(Members {
                nodes: BTreeMap::new(),
                next_index: 1,
            }),
            bus,
            config,
            consumer: format!("registry-{}", std::process::id()),
        }
    }

    /// Timing and eviction policy.
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Load the durable alive-set into the member map. Returns the number of members.
    ///
    /// Stored indices are kept; the next joiner gets one past the highest.
    pub async fn seed_from_bus(&self) -> Result<usize> {
        let alive = self.bus.alive_members().await?;
        let mut members = self.members.lock().await;
        let now = Utc::now();
        for (id, record) in alive {
            members.next_index = members.next_index.max(record.index + 1);
            members.nodes.insert(
                id.clone(),
                StorageNode {
                    id,
                    index: record.index,
                    port: record.port,
                    last_seen: now,
                },
            );
        }
        info!(members = members.nodes.len(), next_index = members.next_index, "registry seeded from alive-set");
        Ok(members.nodes.len())
    }

    /// Register a joining node. Returns `None` when it is already a member.
    pub async fn join(&self, event: &MembershipEvent) -> Result<Option<StorageNode>> {
        let mut members = self.members.lock().await;
        if members.nodes.contains_key(&event.id) {
            debug!(node_id = %event.id, "join for existing member ignored");
            return Ok(None);
        }
        let node = StorageNode {
            id: event.id.clone(),
            index: members.next_index,
            port: event.port,
            last_seen: Utc::now(),
        };
        self.bus
            .mark_alive(
                &node.id,
                NodeRecord {
                    port: node.port,
                    index: node.index,
                },
            )
            .await?;
        members.next_index += 1;
        members.nodes.insert(node.id.clone(), node.clone());
        info!(node_id = %node.id, index = node.index, port = node.port, members = members.nodes.len(), "storage node joined");
        self.broadcast(&members.nodes).await;
        Ok(Some(node))
    }

    /// Remove a departing node. Returns `None` when it was not a member.
    pub async fn leave(&self, node_id: &str) -> Result<Option<StorageNode>> {
        let mut members = self.members.lock().await;
        if !members.nodes.contains_key(node_id) {
            debug!(node_id, "leave for unknown node ignored");
            return Ok(None);
        }
        self.bus.mark_dead(node_id).await?;
        let removed = members.nodes.remove(node_id);
        info!(node_id, members = members.nodes.len(), "storage node left");
        self.broadcast(&members.nodes).await;
        Ok(removed)
    }

    /// Drop a member that failed its health check.
    pub async fn evict(&self, node_id: &str) -> Result<bool> {
        let mut members = self.members.lock().await;
        if members.nodes.remove(node_id).is_none() {
            return Ok(false);
        }
        if self.config.purge_durable_on_evict {
            self.bus.mark_dead(node_id).await?;
        }
        warn!(
            node_id,
            purged = self.config.purge_durable_on_evict,
            members = members.nodes.len(),
            "storage node evicted"
        );
        self.broadcast(&members.nodes).await;
        Ok(true)
    }

    /// Refresh `last_seen` of a member. Returns `false` for non-members.
    pub async fn touch(&self, node_id: &str) -> bool {
        let mut members = self.members.lock().await;
        match members.nodes.get_mut(node_id) {
            Some(node) => {
                node.last_seen = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Copy of the member map.
    pub async fn snapshot(&self) -> MemberSnapshot {
        self.members.lock().await.nodes.clone()
    }

    /// One member, if present.
    pub async fn member(&self, node_id: &str) -> Option<StorageNode> {
        self.members.lock().await.nodes.get(node_id).cloned()
    }

    /// Number of members.
    pub async fn len(&self) -> usize {
        self.members.lock().await.nodes.len()
    }

    /// Whether there are no members.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Ids of members whose `last_seen` is older than `stale_after` at `now`.
    pub async fn stale_members(&self, now: DateTime<Utc>) -> Vec<String> {
        let stale_after = self.config.stale_after;
        self.members
            .lock()
            .await
            .nodes
            .values()
            .filter(|node| {
                now.signed_duration_since(node.last_seen)
                    .to_std()
                    .is_ok_and(|elapsed| elapsed > stale_after)
            })
            .map(|node| node.id.clone())
            .collect()
    }

    async fn broadcast(&self, nodes: &MemberSnapshot) {
        let message = match encode_snapshot(nodes) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "failed to encode member snapshot");
                return;
            }
        };
        match self.bus.publish(UPDATE_CHANNEL, message).await {
            Ok(receivers) => debug!(members = nodes.len(), receivers, "member snapshot broadcast"),
            Err(e) => warn!(error = %e, "failed to broadcast member snapshot"),
        }
    }

    /// Ping one member on its health channel and wait for a pong.
    pub async fn check_node(&self, node_id: &str) -> Result<bool> {
        let channel = health_channel(node_id);
        let mut rx = self.bus.subscribe(&channel).await?;
        self.bus.publish(&channel, PING.to_string()).await?;
        let deadline = Instant::now() + self.config.health_check_timeout;
        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Ok(message)) if message == PONG => return Ok(true),
                Ok(Ok(_)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => return Ok(false),
            }
        }
    }

    /// Check every stale member concurrently; refresh responders and evict the rest.
    pub async fn health_sweep(self: &Arc<Self>) -> SweepReport {
        let stale = self.stale_members(Utc::now()).await;
        let mut report = SweepReport {
            checked: stale.len(),
            ..SweepReport::default()
        };
        if stale.is_empty() {
            return report;
        }

        let mut handles = Vec::with_capacity(stale.len());
        for node_id in stale {
            let registry = self.clone();
            handles.push(tokio::spawn(async move {
                let alive = match registry.check_node(&node_id).await {
                    Ok(alive) => alive,
                    Err(e) => {
                        warn!(node_id = %node_id, error = %e, "health check failed");
                        false
                    }
                };
                (node_id, alive)
            }));
        }

        for handle in handles {
            let Ok((node_id, alive)) = handle.await else {
                continue;
            };
            if alive {
                if self.touch(&node_id).await {
                    report.refreshed.push(node_id);
                }
            } else {
                match self.evict(&node_id).await {
                    Ok(true) => report.evicted.push(node_id),
                    Ok(false) => {}
                    Err(e) => warn!(node_id = %node_id, error = %e, "eviction failed"),
                }
            }
        }
        debug!(checked = report.checked, refreshed = report.refreshed.len(), evicted = report.evicted.len(), "health sweep finished");
        report
    }

    /// Consume join events until shutdown.
    pub async fn run_join_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.consume(JOIN_STREAM, shutdown).await
    }

    /// Consume leave events until shutdown.
    pub async fn run_leave_loop(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        self.consume(LEAVE_STREAM, shutdown).await
    }

    async fn apply(&self, stream: &str, event: &MembershipEvent) -> Result<()> {
        if stream == LEAVE_STREAM {
            self.leave(&event.id).await?;
        } else {
            self.join(event).await?;
        }
        Ok(())
    }

    async fn consume(self: Arc<Self>, stream: &'static str, mut shutdown: watch::Receiver<bool>) {
        debug!(stream, "membership loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                read = self.bus.read_group(stream, REGISTRY_GROUP, &self.consumer, STREAM_BLOCK) => read,
            };
            let entries = match read {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(stream, error = %e, "failed to read membership stream");
                    tokio::time::sleep(BUS_RETRY_DELAY).await;
                    continue;
                }
            };
            for entry in entries {
                match self.apply(stream, &entry.event).await {
                    Ok(()) => {
                        if let Err(e) = self.bus.ack(stream, REGISTRY_GROUP, entry.id).await {
                            warn!(stream, entry_id = entry.id, error = %e, "failed to acknowledge entry");
                        }
                    }
                    Err(e) => {
                        warn!(stream, node_id = %entry.event.id, deliveries = entry.deliveries, error = %e, "membership event not applied");
                    }
                }
            }
        }
        debug!(stream, "membership loop stopped");
    }

    /// Run [`Registry::health_sweep`] every `health_check_interval` until shutdown.
    pub async fn run_health_sweep(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.health_check_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    self.health_sweep().await;
                }
            }
        }
        debug!("health sweep stopped");
    }
}
