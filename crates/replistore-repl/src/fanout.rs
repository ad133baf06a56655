//! Upload fan-out: parallel dispatch of one encoded upload packet to every replica.
//!
//! Each target gets its own task and its own connection, so a stalled replica only holds
//! up its own send. [`FanoutSender::fanout`] waits for every task and reports the
//! per-target outcome instead of failing as a whole.

use std::sync::Arc;

use replistore_storage::UploadStatus;
use replistore_transport::TcpTransport;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ReplError;

/// A replica to send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutTarget {
    /// Replica id.
    pub node_id: String,
    /// `host:port` of its command service.
    pub addr: String,
}

/// Result of the send to one replica.
#[derive(Debug, Clone)]
pub struct FanoutResult {
    /// Replica id.
    pub node_id: String,
    /// Whether the replica acknowledged the write.
    pub success: bool,
    /// Error message if failed.
    pub error: Option<String>,
    /// Microseconds from dial to acknowledgement.
    pub latency_us: u64,
}

/// Summary of a fan-out across all replicas.
#[derive(Debug, Clone, Default)]
pub struct FanoutSummary {
    /// Number of replicas attempted.
    pub total_targets: usize,
    /// Number of acknowledged writes.
    pub successful: usize,
    /// Number of failed writes.
    pub failed: usize,
    /// Individual results, ordered by node id.
    pub results: Vec<FanoutResult>,
}

impl FanoutSummary {
    /// Returns true if every replica acknowledged.
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0 && self.total_targets > 0
    }

    /// Returns true if any replica failed.
    pub fn any_failed(&self) -> bool {
        self.failed > 0
    }

    /// Ids of replicas that acknowledged.
    pub fn successful_node_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.success)
            .map(|r| r.node_id.clone())
            .collect()
    }

    /// Ids of replicas that did not.
    pub fn failed_node_ids(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| !r.success)
            .map(|r| r.node_id.clone())
            .collect()
    }
}

/// Sends encoded upload packets to replicas in parallel.
#[derive(Debug, Clone, Default)]
pub struct FanoutSender {
    transport: TcpTransport,
}

impl FanoutSender {
    /// Create a sender dialing with `transport`.
    pub fn new(transport: TcpTransport) -> Self {
        Self { transport }
    }

    /// Send `payload` to every target and wait for all of them.
    pub async fn fanout(&self, payload: Arc<Vec<u8>>, targets: Vec<FanoutTarget>) -> FanoutSummary {
        if targets.is_empty() {
            return FanoutSummary::default();
        }

        let mut handles = Vec::with_capacity(targets.len());
        for target in targets {
            let transport = self.transport.clone();
            let payload = payload.clone();
            let node_id = target.node_id.clone();
            handles.push((node_id, tokio::spawn(async move {
                let start = Instant::now();
                let result = send_upload(&transport, &target, &payload).await;
                let latency_us = start.elapsed().as_micros() as u64;
                match result {
                    Ok(()) => FanoutResult {
                        node_id: target.node_id,
                        success: true,
                        error: None,
                        latency_us,
                    },
                    Err(e) => FanoutResult {
                        node_id: target.node_id,
                        success: false,
                        error: Some(e.to_string()),
                        latency_us,
                    },
                }
            })));
        }

        summarize(collect(handles).await)
    }
}

/// Await every send task. A task that panicked or was cancelled counts as a failure of
/// its target.
async fn collect(handles: Vec<(String, JoinHandle<FanoutResult>)>) -> Vec<FanoutResult> {
    let mut results = Vec::with_capacity(handles.len());
    for (node_id, handle) in handles {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(node_id = %node_id, error = %e, "fanout send task aborted");
                results.push(FanoutResult {
                    node_id,
                    success: false,
                    error: Some(e.to_string()),
                    latency_us: 0,
                });
            }
        }
    }
    results
}

fn summarize(mut results: Vec<FanoutResult>) -> FanoutSummary {
    let successful = results.iter().filter(|r| r.success).count();
    let failed = results.len() - successful;
    results.sort_by(|a, b| a.node_id.cmp(&b.node_id));
    debug!(targets = results.len(), successful, failed, "fanout finished");

    FanoutSummary {
        total_targets: results.len(),
        successful,
        failed,
        results,
    }
}

async fn send_upload(transport: &TcpTransport, target: &FanoutTarget, payload: &[u8]) -> Result<(), ReplError> {
    let reply = transport.request(&target.addr, payload).await?;
    match UploadStatus::decode(&reply)? {
        UploadStatus::Stored => Ok(()),
        UploadStatus::Failed { reason } => Err(ReplError::UploadRejected {
            node_id: target.node_id.clone(),
            reason,
        }),
    }
}
