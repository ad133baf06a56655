//! Replica side of the health check: answer every `"ping"` on the node's health channel
//! with a `"pong"`.

use std::sync::Arc;

use tokio::sync::{broadcast, watch};
use tracing::{debug, trace, warn};

use crate::membership::{health_channel, MembershipBus, PING, PONG};

/// Answer pings until shutdown or until the channel closes.
///
/// `rx` must already be subscribed to the node's health channel, so pings sent right after
/// the node joins are not missed.
pub async fn run_health_responder(
    bus: Arc<dyn MembershipBus>,
    node_id: String,
    mut rx: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let channel = health_channel(&node_id);
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            message = rx.recv() => match message {
                Ok(message) if message == PING => {
                    trace!(node_id = %node_id, "ping received");
                    if let Err(e) = bus.publish(&channel, PONG.to_string()).await {
                        warn!(node_id = %node_id, error = %e, "failed to answer health check");
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(node_id = %node_id, skipped, "health channel lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
    debug!(node_id = %node_id, "health responder stopped");
}
