//! Coordinator runtime: registry loops plus the client listener.

use std::net::SocketAddr;
use std::sync::Arc;

use replistore_transport::serve;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::Catalog;
use crate::config::ServerConfig;
use crate::coordinator::Coordinator;
use crate::error::Result;
use crate::membership::MembershipBus;
use crate::registry::Registry;

/// A running coordinator.
pub struct ServerRuntime {
    registry: Arc<Registry>,
    coordinator: Arc<Coordinator>,
    addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerRuntime {
    /// Reseed the registry, then start the join, leave and health loops and the listener.
    pub async fn start(config: ServerConfig, bus: Arc<dyn MembershipBus>, catalog: Arc<dyn Catalog>) -> Result<Self> {
        let registry = Arc::new(Registry::new(bus, config.registry_config()));
        let seeded = registry.seed_from_bus().await?;
        let coordinator = Arc::new(Coordinator::new(registry.clone(), catalog, &config));

        let listener = config
            .transport()
            .listen(&format!("0.0.0.0:{}", config.tcp_port))
            .await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(registry.clone().run_join_loop(shutdown_rx.clone())),
            tokio::spawn(registry.clone().run_leave_loop(shutdown_rx.clone())),
            tokio::spawn(registry.clone().run_health_sweep(shutdown_rx.clone())),
            tokio::spawn(serve(listener, coordinator.clone(), shutdown_rx)),
        ];
        info!(addr = %addr, seeded, "coordinator started");

        Ok(Self {
            registry,
            coordinator,
            addr,
            shutdown_tx,
            tasks,
        })
    }

    /// The replica registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The client-facing coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Bound listener address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop the loops and the listener.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        debug!(addr = %self.addr, "coordinator stopped");
    }
}
