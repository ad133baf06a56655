//! Test harness: temp directories and an in-process cluster of one coordinator and any
//! number of replicas sharing a single in-memory membership bus.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Once};
use std::time::Duration;

use anyhow::{anyhow, Result};
use replistore_repl::{
    Client, MemoryBus, MemoryCatalog, NodeConfig, ServerConfig, ServerRuntime, StorageNodeRuntime,
};
use replistore_transport::SenderMeta;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a test-friendly subscriber once per process (honours `RUST_LOG`).
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Poll `check` until it returns true or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Every file under `dir` as `(relative path, contents)`, sorted.
pub fn tree_contents(dir: &Path) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    walk(dir, dir, &mut out)?;
    out.sort();
    Ok(out)
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, Vec<u8>)>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else {
            let rel = path.strip_prefix(root)?.to_string_lossy().into_owned();
            out.push((rel, std::fs::read(&path)?));
        }
    }
    Ok(())
}

/// A named scratch directory removed on drop.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
    test_name: String,
}

impl TestEnv {
    pub fn new(test_name: &str) -> Result<Self> {
        let temp_dir = tempfile::Builder::new()
            .prefix(&format!("{test_name}-"))
            .tempdir()?;
        Ok(Self {
            temp_dir,
            test_name: test_name.to_string(),
        })
    }

    pub fn tempdir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    /// Data directory of a replica.
    pub fn node_dir(&self, node_id: &str) -> PathBuf {
        self.temp_dir.path().join(node_id)
    }
}

/// Coordinator plus replicas on ephemeral localhost ports.
pub struct TestCluster {
    env: TestEnv,
    bus: Arc<MemoryBus>,
    catalog: Arc<MemoryCatalog>,
    config: ServerConfig,
    server: Option<ServerRuntime>,
    nodes: Vec<StorageNodeRuntime>,
}

impl TestCluster {
    /// Server settings for tests: ephemeral port, sweeps only when a test triggers them.
    pub fn test_server_config() -> ServerConfig {
        ServerConfig {
            tcp_port: 0,
            replica_host: "127.0.0.1".to_string(),
            health_check_interval_secs: 3600,
            stale_after_secs: 0,
            health_check_timeout_secs: 1,
            connect_timeout_ms: 1000,
            purge_durable_on_evict: true,
        }
    }

    pub async fn start(test_name: &str) -> Result<Self> {
        Self::start_with(test_name, Self::test_server_config()).await
    }

    pub async fn start_with(test_name: &str, config: ServerConfig) -> Result<Self> {
        init_tracing();
        let env = TestEnv::new(test_name)?;
        let bus = Arc::new(MemoryBus::new());
        let catalog = Arc::new(MemoryCatalog::new());
        let server = ServerRuntime::start(config.clone(), bus.clone(), catalog.clone()).await?;
        Ok(Self {
            env,
            bus,
            catalog,
            config,
            server: Some(server),
            nodes: Vec::new(),
        })
    }

    pub fn env(&self) -> &TestEnv {
        &self.env
    }

    pub fn bus(&self) -> &Arc<MemoryBus> {
        &self.bus
    }

    pub fn catalog(&self) -> &Arc<MemoryCatalog> {
        &self.catalog
    }

    pub fn server(&self) -> Result<&ServerRuntime> {
        self.server.as_ref().ok_or_else(|| anyhow!("coordinator is stopped"))
    }

    /// Stop the coordinator and start a fresh one over the same bus and catalog.
    pub async fn restart_server(&mut self) -> Result<()> {
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
        let server = ServerRuntime::start(self.config.clone(), self.bus.clone(), self.catalog.clone()).await?;
        self.server = Some(server);
        Ok(())
    }

    /// Start a replica and wait until the registry lists it.
    pub async fn add_node(&mut self, node_id: &str) -> Result<&StorageNodeRuntime> {
        let config = NodeConfig {
            node_id: Some(node_id.to_string()),
            port: 0,
            bind_host: "127.0.0.1".to_string(),
            peer_host: "127.0.0.1".to_string(),
            data_dir: self.env.node_dir(node_id),
            connect_timeout_ms: 1000,
            ..NodeConfig::default()
        };
        let node = StorageNodeRuntime::start(config, self.bus.clone()).await?;
        let registry = self.server()?.registry().clone();
        let registry = &registry;
        if !eventually(Duration::from_secs(5), || async move { registry.member(node_id).await.is_some() }).await {
            return Err(anyhow!("{node_id} never joined the registry"));
        }
        self.nodes.push(node);
        self.node(node_id)
    }

    pub fn node(&self, node_id: &str) -> Result<&StorageNodeRuntime> {
        self.nodes
            .iter()
            .find(|n| n.node_id() == node_id)
            .ok_or_else(|| anyhow!("no running node {node_id}"))
    }

    fn take_node(&mut self, node_id: &str) -> Result<StorageNodeRuntime> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.node_id() == node_id)
            .ok_or_else(|| anyhow!("no running node {node_id}"))?;
        Ok(self.nodes.remove(pos))
    }

    /// Gracefully stop a replica and wait until the registry drops it.
    pub async fn remove_node(&mut self, node_id: &str) -> Result<()> {
        self.take_node(node_id)?.shutdown().await?;
        let registry = self.server()?.registry().clone();
        let registry = &registry;
        if !eventually(Duration::from_secs(5), || async move { registry.member(node_id).await.is_none() }).await {
            return Err(anyhow!("{node_id} never left the registry"));
        }
        Ok(())
    }

    /// Stop a replica without telling anyone, as if it crashed.
    pub async fn crash_node(&mut self, node_id: &str) -> Result<()> {
        self.take_node(node_id)?.halt().await;
        Ok(())
    }

    /// Client acting as `email`.
    pub fn client(&self, email: &str) -> Result<Client> {
        let port = self.server()?.addr().port();
        Ok(Client::new(
            format!("127.0.0.1:{port}"),
            SenderMeta::new(email, "test-agent", "client"),
        ))
    }

    /// Uploads tree of a running replica.
    pub fn uploads_dir(&self, node_id: &str) -> Result<PathBuf> {
        Ok(self.node(node_id)?.service().store().uploads_dir())
    }

    pub async fn shutdown(mut self) {
        for node in self.nodes.drain(..) {
            node.halt().await;
        }
        if let Some(server) = self.server.take() {
            server.shutdown().await;
        }
    }
}
