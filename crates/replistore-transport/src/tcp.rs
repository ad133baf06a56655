//! TCP transport with 8-byte big-endian length-prefixed frames.
//!
//! Every exchange on the wire is `[u64 BE payload length][payload]`. A request/response
//! round trip is one [`TcpTransport::send_framed`] followed by one [`read_frame`] on the
//! same stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{Result, TransportError};

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 8;

/// Default upper bound on a single frame (1 GiB).
pub const DEFAULT_MAX_FRAME_BYTES: u64 = 1 << 30;

/// TCP transport configuration
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Connection timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whether to enable TCP_NODELAY (disable Nagle's algorithm).
    pub nodelay: bool,
    /// Frames announcing more than this many bytes are rejected.
    pub max_frame_bytes: u64,
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5000,
            nodelay: true,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// TCP transport: dials peers and binds listeners.
#[derive(Debug, Clone, Default)]
pub struct TcpTransport {
    config: TcpTransportConfig,
}

impl TcpTransport {
    /// Creates a new TCP transport with the given configuration.
    pub fn new(config: TcpTransportConfig) -> Self {
        Self { config }
    }

    /// Returns the active configuration.
    pub fn config(&self) -> &TcpTransportConfig {
        &self.config
    }

    /// Establishes a TCP connection to the specified address.
    pub async fn connect(&self, addr: &str) -> Result<TcpStream> {
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::ConnectionTimeout {
                addr: addr.to_string(),
                timeout_ms: self.config.connect_timeout_ms,
            })?
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::ConnectionRefused => TransportError::ConnectionRefused {
                    addr: addr.to_string(),
                },
                _ => TransportError::IoError(e),
            })?;
        if self.config.nodelay {
            stream.set_nodelay(true)?;
        }
        tracing::debug!(addr = addr, "TCP connected");
        Ok(stream)
    }

    /// Binds to the specified address and returns a listener for incoming connections.
    pub async fn listen(&self, addr: &str) -> Result<TcpListener> {
        TcpListener::bind(addr).await.map_err(TransportError::IoError)
    }

    /// Dials `addr`, writes one frame carrying `payload` and hands back the open stream
    /// so the caller can read a response. The caller owns closing it.
    pub async fn send_framed(&self, addr: &str, payload: &[u8]) -> Result<TcpStream> {
        let mut stream = self.connect(addr).await?;
        write_frame(&mut stream, payload).await?;
        Ok(stream)
    }

    /// One request/response exchange: send a frame, read one frame back, close.
    pub async fn request(&self, addr: &str, payload: &[u8]) -> Result<Vec<u8>> {
        let mut stream = self.send_framed(addr, payload).await?;
        let response = read_frame(&mut stream, self.config.max_frame_bytes).await;
        let _ = stream.shutdown().await;
        response
    }
}

/// Writes `payload` as a single length-prefixed frame.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_u64(payload.len() as u64).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a single length-prefixed frame, rejecting lengths above `max_frame_bytes`.
pub async fn read_frame<R>(reader: &mut R, max_frame_bytes: u64) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let size = reader.read_u64().await.map_err(map_eof)?;
    if size > max_frame_bytes {
        return Err(TransportError::FrameTooLarge {
            size,
            max_size: max_frame_bytes,
        });
    }
    let mut payload = vec![0u8; size as usize];
    if !payload.is_empty() {
        reader.read_exact(&mut payload).await.map_err(map_eof)?;
    }
    tracing::trace!(size, "frame received");
    Ok(payload)
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::IoError(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_send_recv_frame() {
        let transport = TcpTransport::new(TcpTransportConfig::default());
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
            assert_eq!(frame, b"ping");
            write_frame(&mut stream, b"pong").await.unwrap();
        });

        let client_transport = TcpTransport::new(TcpTransportConfig::default());
        let response = client_transport.request(&addr, b"ping").await.unwrap();
        assert_eq!(response, b"pong");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_length_prefix_is_big_endian_u64() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"abc").await.unwrap();
        assert_eq!(&buf[..LENGTH_PREFIX_SIZE], &[0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(&buf[LENGTH_PREFIX_SIZE..], b"abc");
    }

    #[tokio::test]
    async fn test_empty_frame() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[]).await.unwrap();
        let mut reader = buf.as_slice();
        let frame = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap();
        assert!(frame.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &[7u8; 64]).await.unwrap();
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader, 16).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::FrameTooLarge {
                size: 64,
                max_size: 16
            }
        ));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_connection_closed() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"truncated payload").await.unwrap();
        buf.truncate(LENGTH_PREFIX_SIZE + 4);
        let mut reader = buf.as_slice();
        let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_BYTES).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let transport = TcpTransport::default();
        let listener = transport.listen("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = transport.send_framed(&addr, b"x").await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::ConnectionRefused { .. } | TransportError::IoError(_)
        ));
    }
}
