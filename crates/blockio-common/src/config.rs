//! Configuration consumed by the blockio core.
//!
//! The structures here describe what the core needs to know about a vdisk
//! and its storage clusters; where that data comes from and how updates are
//! delivered is the [`crate::source`] contract.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{BlockSize, VdiskId, VdiskType};

/// Lifecycle state of a single storage server slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    /// Serving traffic
    Online,
    /// Temporarily out of rotation
    Offline,
    /// Being drained, its objects respread over the rest of the cluster
    Respread,
    /// Permanently retired; the slot is kept so routing stays stable
    Rip,
}

impl ServerState {
    /// Whether a server in this state accepts operations
    #[must_use]
    pub const fn is_operational(self) -> bool {
        matches!(self, Self::Online)
    }
}

impl Default for ServerState {
    fn default() -> Self {
        Self::Online
    }
}

/// Configuration of one ARDB storage server
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageServerConfig {
    /// TCP address, `host:port`
    pub address: String,
    /// Database index selected after dialing
    #[serde(default)]
    pub database: i64,
    /// Lifecycle state of this server slot
    #[serde(default)]
    pub state: ServerState,
}

impl StorageServerConfig {
    /// Create a config for an online server
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            database: 0,
            state: ServerState::Online,
        }
    }

    /// Validate this server config
    ///
    /// # Errors
    ///
    /// `InvalidInput` on an empty address or negative database index.
    pub fn validate(&self) -> Result<()> {
        if self.address.is_empty() {
            return Err(Error::invalid_input("storage server address is empty"));
        }
        if self.database < 0 {
            return Err(Error::invalid_input(format!(
                "storage server database index {} is negative",
                self.database
            )));
        }
        Ok(())
    }
}

/// Ordered configuration of an ARDB storage cluster.
///
/// The order of the servers defines the routing space: routing is
/// computed over the full slice length, with non-operational slots
/// skipped by predicate.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageClusterConfig {
    pub servers: Vec<StorageServerConfig>,
}

impl StorageClusterConfig {
    /// Create a cluster config from server configs
    #[must_use]
    pub fn new(servers: Vec<StorageServerConfig>) -> Self {
        Self { servers }
    }

    /// Validate this cluster config.
    ///
    /// # Errors
    ///
    /// - `ServerStateNotSupported` when any server is in a state other
    ///   than `Online` or `Rip`; other states have no defined routing
    ///   semantics and are rejected up front, never at runtime.
    /// - `NoServersAvailable` when no server is online.
    /// - `InvalidInput` when any server config is itself invalid.
    pub fn validate(&self) -> Result<()> {
        let mut available = 0u64;
        for server in &self.servers {
            match server.state {
                ServerState::Online => {
                    server.validate()?;
                    available += 1;
                }
                ServerState::Rip => {}
                _ => return Err(Error::ServerStateNotSupported),
            }
        }
        if available == 0 {
            return Err(Error::NoServersAvailable);
        }
        Ok(())
    }

    /// Full length of the routing space, retired slots included
    #[must_use]
    pub fn server_count(&self) -> u64 {
        self.servers.len() as u64
    }

    /// Number of online servers
    #[must_use]
    pub fn available_server_count(&self) -> u64 {
        self.servers
            .iter()
            .filter(|s| s.state.is_operational())
            .count() as u64
    }
}

/// Static (non-reloadable) configuration of a vdisk
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiskStaticConfig {
    #[serde(rename = "type")]
    pub vdisk_type: VdiskType,
    pub block_size: BlockSize,
    /// Template vdisk this one was cloned from, if any
    #[serde(default)]
    pub template_vdisk_id: Option<VdiskId>,
}

/// The cluster references a vdisk's block storage resolves through.
///
/// Both references are hot-reloadable; see [`crate::source`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VdiskNbdConfig {
    /// Identifier of the primary storage cluster (required)
    pub storage_cluster_id: String,
    /// Identifier of the template storage cluster, if any
    #[serde(default)]
    pub template_cluster_id: Option<String>,
}
