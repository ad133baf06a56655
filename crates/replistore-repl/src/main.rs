use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use replistore_repl::{ClusterConfig, MemoryBus, MemoryCatalog, ServerRuntime, StorageNodeRuntime};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "replistore")]
#[command(about = "Replicated object store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the coordinator and the configured replicas in one process.
    Serve {
        #[arg(short, long, default_value = "replistore.toml", env = "REPLISTORE_CONFIG")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve { config } => serve(config).await,
    }
}

async fn serve(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        ClusterConfig::from_file(&config_path)?
    } else {
        tracing::warn!("Config file not found, using defaults: {}", config_path.display());
        ClusterConfig::default()
    };

    let bus = Arc::new(MemoryBus::new());
    let catalog = Arc::new(MemoryCatalog::new());
    let server = ServerRuntime::start(config.server.clone(), bus.clone(), catalog).await?;

    let mut nodes = Vec::with_capacity(config.nodes.len());
    for node_config in config.nodes {
        nodes.push(StorageNodeRuntime::start(node_config, bus.clone()).await?);
    }
    tracing::info!(addr = %server.addr(), replicas = nodes.len(), "replistore running");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");

    for node in nodes {
        if let Err(e) = node.shutdown().await {
            tracing::warn!(error = %e, "replica shutdown failed");
        }
    }
    server.shutdown().await;
    Ok(())
}
