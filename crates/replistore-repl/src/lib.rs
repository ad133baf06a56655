#![warn(missing_docs)]

//! Replistore replication subsystem: replica registry and health sweep, upload fan-out,
//! download routing, predecessor catch-up, and the coordinator and replica runtimes.

pub mod catalog;
pub mod catchup;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod health;
pub mod membership;
pub mod node;
pub mod registry;
pub mod server;

pub use catalog::{Catalog, FileLookup, FileRecord, FileVersion, MemoryCatalog};
pub use catchup::{CatchUp, CatchUpMode, CatchUpOutcome};
pub use client::Client;
pub use config::{ClusterConfig, NodeConfig, ServerConfig};
pub use coordinator::{Coordinator, UploadReceipt};
pub use error::{ReplError, Result};
pub use fanout::{FanoutResult, FanoutSender, FanoutSummary, FanoutTarget};
pub use membership::{MemberSnapshot, MembershipBus, MembershipEvent, MemoryBus, NodeRecord, StorageNode};
pub use node::StorageNodeRuntime;
pub use registry::{Registry, RegistryConfig, SweepReport};
pub use server::ServerRuntime;
