//! Error types for the transport subsystem.

use thiserror::Error;

/// Errors raised while dialing, framing or decoding.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer refused the connection.
    #[error("connection refused to {addr}")]
    ConnectionRefused {
        /// Address that was dialed.
        addr: String,
    },

    /// Dialing did not complete in time.
    #[error("connection timeout after {timeout_ms}ms to {addr}")]
    ConnectionTimeout {
        /// Address that was dialed.
        addr: String,
        /// Configured timeout.
        timeout_ms: u64,
    },

    /// The peer closed the stream before a full frame arrived.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The announced frame length exceeds the configured maximum.
    #[error("frame too large: {size} bytes (max {max_size})")]
    FrameTooLarge {
        /// Announced payload length.
        size: u64,
        /// Maximum accepted payload length.
        max_size: u64,
    },

    /// A packet could not be decoded; fatal to the connection.
    #[error("protocol violation: {0}")]
    Decode(String),

    /// A packet could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// Payload compression or decompression failed.
    #[error("compression error: {0}")]
    Compression(String),

    /// Any other socket-level failure.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// Result alias for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
