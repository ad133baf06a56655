#![warn(missing_docs)]

//! Replistore transport subsystem: length-prefixed TCP framing, connection accept loop,
//! and the transfer packet codec shared by clients, the coordinator and storage replicas.

pub mod compress;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tcp;

pub use error::{Result, TransportError};
pub use protocol::{Command, SenderMeta, TransferPacket};
pub use server::{serve, ConnectionHandler};
pub use tcp::{TcpTransport, TcpTransportConfig};
