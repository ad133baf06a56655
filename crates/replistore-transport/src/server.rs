//! Connection accept loop.
//!
//! [`serve`] accepts connections until the shutdown signal flips, spawning one task per
//! connection. Accept failures are logged and the loop keeps going. Whatever the handler
//! returns, the stream is shut down once it finishes.

use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Handles one accepted connection from start to finish.
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Error reported when handling fails.
    type Error: Display + Send;

    /// Serve a single connection. The stream is closed by the caller afterwards.
    async fn handle(&self, stream: &mut TcpStream, peer: SocketAddr) -> Result<(), Self::Error>;
}

/// Run the accept loop on `listener` until `shutdown` becomes `true`.
pub async fn serve<H>(listener: TcpListener, handler: Arc<H>, mut shutdown: watch::Receiver<bool>)
where
    H: ConnectionHandler,
{
    let local = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    debug!(addr = %local, "listener started");
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!(addr = %local, "listener stopping");
                    return;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        let handler = handler.clone();
                        tokio::spawn(handle_connection(stream, peer, handler));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                    }
                }
            }
        }
    }
}

async fn handle_connection<H>(mut stream: TcpStream, peer: SocketAddr, handler: Arc<H>)
where
    H: ConnectionHandler,
{
    if let Err(e) = handler.handle(&mut stream, peer).await {
        warn!(peer = %peer, error = %e, "connection handler failed");
    }
    let _ = stream.shutdown().await;
}
