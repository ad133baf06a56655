//! Storage replica runtime: command listener, join/leave, health responder and
//! snapshot-driven catch-up.

use std::net::SocketAddr;
use std::sync::Arc;

use replistore_storage::StorageNodeService;
use replistore_transport::serve;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::catchup::CatchUp;
use crate::config::NodeConfig;
use crate::error::Result;
use crate::health::run_health_responder;
use crate::membership::{
    decode_snapshot, health_channel, MembershipBus, MembershipEvent, JOIN_STREAM, LEAVE_STREAM,
    UPDATE_CHANNEL,
};

/// A running storage replica.
pub struct StorageNodeRuntime {
    node_id: String,
    addr: SocketAddr,
    service: Arc<StorageNodeService>,
    catchup: Arc<CatchUp>,
    bus: Arc<dyn MembershipBus>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StorageNodeRuntime {
    /// Open the data directory, start listening and announce the node on the join stream.
    pub async fn start(config: NodeConfig, bus: Arc<dyn MembershipBus>) -> Result<Self> {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let transport = config.transport();
        let service = Arc::new(
            StorageNodeService::open(node_id.clone(), &config.data_dir)
                .await?
                .with_max_frame_bytes(config.max_frame_bytes),
        );
        let listener = transport
            .listen(&format!("{}:{}", config.bind_host, config.port))
            .await?;
        let addr = listener.local_addr()?;
        // Catch-up mode is fixed before the join makes this node a fan-out target.
        let catchup = Arc::new(CatchUp::open(service.clone(), transport, config.peer_host.clone()).await?);

        // Subscribe before joining so the first snapshot and ping are not missed.
        let updates = bus.subscribe(UPDATE_CHANNEL).await?;
        let pings = bus.subscribe(&health_channel(&node_id)).await?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(serve(listener, service.clone(), shutdown_rx.clone())),
            tokio::spawn(run_health_responder(
                bus.clone(),
                node_id.clone(),
                pings,
                shutdown_rx.clone(),
            )),
            tokio::spawn(watch_snapshots(catchup.clone(), updates, shutdown_rx)),
        ];

        bus.produce(JOIN_STREAM, MembershipEvent::new(node_id.clone(), addr.port()))
            .await?;
        info!(node_id = %node_id, addr = %addr, data_dir = %config.data_dir.display(), "storage node started");

        Ok(Self {
            node_id,
            addr,
            service,
            catchup,
            bus,
            shutdown_tx,
            tasks,
        })
    }

    /// Node id.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Bound listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Bound listener port.
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// The replica's command service.
    pub fn service(&self) -> &Arc<StorageNodeService> {
        &self.service
    }

    /// The replica's catch-up driver.
    pub fn catchup(&self) -> &Arc<CatchUp> {
        &self.catchup
    }

    /// Announce departure, then stop every task.
    pub async fn shutdown(self) -> Result<()> {
        let node_id = self.node_id.clone();
        let leave = self
            .bus
            .produce(LEAVE_STREAM, MembershipEvent::new(node_id.clone(), self.port()))
            .await;
        self.halt().await;
        leave?;
        info!(node_id = %node_id, "storage node stopped");
        Ok(())
    }

    /// Stop every task without announcing departure, as a crashed node would.
    pub async fn halt(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(node_id = %self.node_id, "storage node tasks stopped");
    }
}

async fn watch_snapshots(
    catchup: Arc<CatchUp>,
    mut updates: broadcast::Receiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let message = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            message = updates.recv() => message,
        };
        let message = match message {
            Ok(message) => message,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "snapshot channel lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let snapshot = match decode_snapshot(&message) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(error = %e, "discarding malformed member snapshot");
                continue;
            }
        };
        // Failures are logged by the driver; a later snapshot retries.
        let _ = catchup.on_snapshot(&snapshot).await;
    }
}
