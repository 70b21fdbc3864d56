//! Registration with the volume manager.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{DataNodeError, Result};
use crate::frame::Frame;
use crate::health::DiskUsage;
use crate::link::TcpConnector;

/// Volume manager accepted the node.
pub const REGISTER_OK: i32 = 0;
/// Volume manager already knew the node.
pub const REGISTER_ALREADY: i32 = 3;

/// What a DataNode tells the volume manager about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRegistration {
    pub host: String,
    pub capacity_gib: u64,
    pub free_gib: u64,
    pub used_gib: u64,
    pub mount_point: String,
    pub tier: String,
    pub status: i32,
}

impl NodeRegistration {
    pub fn new(host: &str, data_dir: &Path, tier: &str, usage: DiskUsage) -> Self {
        Self {
            host: host.to_string(),
            capacity_gib: usage.all_gib(),
            free_gib: usage.free_gib(),
            used_gib: usage.used_gib(),
            mount_point: data_dir.display().to_string(),
            tier: tier.to_string(),
            status: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    AlreadyRegistered,
}

/// Registers with the first reachable host in `hosts`.
///
/// Unreachable hosts are skipped. A reachable host that refuses the node
/// ends the attempt.
pub async fn register_with_volmgr(
    connector: &TcpConnector,
    hosts: &[String],
    registration: &NodeRegistration,
    timeout: Duration,
) -> Result<RegisterOutcome> {
    if hosts.is_empty() {
        return Err(DataNodeError::Registration {
            reason: "no volmgr hosts configured".to_string(),
        });
    }

    for host in hosts {
        let link = match connector.connect(host).await {
            Ok(link) => link,
            Err(e) => {
                warn!("volmgr {} unreachable: {}", host, e);
                continue;
            }
        };

        let reply = link
            .call(&Frame::Register(registration.clone()), timeout)
            .await
            .map_err(|e| DataNodeError::Registration {
                reason: format!("{}: {}", host, e),
            })?;

        return match reply {
            Frame::RegisterAck { ret: REGISTER_OK } => {
                info!("DataNode {} registered with volmgr {}", registration.host, host);
                Ok(RegisterOutcome::Registered)
            }
            Frame::RegisterAck {
                ret: REGISTER_ALREADY,
            } => {
                debug!(
                    "DataNode {} already registered with volmgr {}",
                    registration.host, host
                );
                Ok(RegisterOutcome::AlreadyRegistered)
            }
            Frame::RegisterAck { ret } => Err(DataNodeError::Registration {
                reason: format!("{} refused registration with ret {}", host, ret),
            }),
            other => Err(DataNodeError::Registration {
                reason: format!("{} replied with unexpected {} frame", host, other.kind()),
            }),
        };
    }

    Err(DataNodeError::Registration {
        reason: format!("none of {} volmgr hosts reachable", hosts.len()),
    })
}
