//! ChunkFS DataNode.
//!
//! Stores chunk bytes in local files and relays replication streams along
//! a chain of replicas. Live streams are tracked in two registries, one for
//! streams received from clients and one for streams forwarded to the next
//! replica.

pub mod chunk_file;
pub mod config;
pub mod error;
pub mod frame;
pub mod health;
pub mod link;
pub mod register;
pub mod registry;
pub mod server;
pub mod session;

pub use config::DataNodeConfig;
pub use error::{DataNodeError, Result};
pub use frame::Frame;
pub use link::{LinkConfig, TcpConnector, TcpLink};
pub use registry::{ReplicationStreamRegistry, SessionGuard, StreamId, StreamRegistry};
pub use server::DataNodeServer;
pub use session::{Direction, ReplicationSession};
