//! The configuration-source contract.
//!
//! The core never reads configuration files or talks to a configuration
//! store directly; it consumes a [`Source`]. Reads resolve the current
//! state, watches return a [`watch::Receiver`] whose first `borrow` is the
//! current value and which observes every later update. Dropping the
//! receiver ends the watch.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::config::{StorageClusterConfig, VdiskNbdConfig, VdiskStaticConfig};
use crate::error::{Error, Result};
use crate::types::VdiskId;

/// Kind of a configuration key, used when flagging invalid references
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKeyKind {
    VdiskStatic,
    VdiskNbd,
    StorageCluster,
}

/// A configuration key, used when flagging invalid references
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceKey {
    pub id: String,
    pub kind: SourceKeyKind,
}

impl SourceKey {
    #[must_use]
    pub fn new(id: impl Into<String>, kind: SourceKeyKind) -> Self {
        Self { id: id.into(), kind }
    }
}

/// A provider of vdisk and cluster configuration
pub trait Source: Send + Sync {
    /// Read a vdisk's static configuration.
    fn read_vdisk_static_config(&self, vdisk_id: &VdiskId) -> Result<VdiskStaticConfig>;

    /// Read a vdisk's current NBD cluster references.
    fn read_vdisk_nbd_config(&self, vdisk_id: &VdiskId) -> Result<VdiskNbdConfig>;

    /// Read a storage cluster's current configuration.
    fn read_storage_cluster_config(&self, cluster_id: &str) -> Result<StorageClusterConfig>;

    /// Watch a vdisk's NBD cluster references.
    fn watch_vdisk_nbd_config(&self, vdisk_id: &VdiskId)
        -> Result<watch::Receiver<VdiskNbdConfig>>;

    /// Watch a storage cluster's configuration.
    fn watch_storage_cluster_config(
        &self,
        cluster_id: &str,
    ) -> Result<watch::Receiver<StorageClusterConfig>>;

    /// Flag a key as referencing invalid or missing configuration.
    ///
    /// Called by consumers when a reference obtained from this source
    /// turns out to be unusable; the source may surface this to
    /// operators. Never fails and never blocks.
    fn mark_invalid_key(&self, key: SourceKey, vdisk_id: &VdiskId);
}

#[derive(Default)]
struct InMemoryState {
    vdisks: HashMap<String, VdiskStaticConfig>,
    nbd_configs: HashMap<String, watch::Sender<VdiskNbdConfig>>,
    clusters: HashMap<String, watch::Sender<StorageClusterConfig>>,
    invalid_keys: Vec<(SourceKey, VdiskId)>,
}

/// An in-memory [`Source`].
///
/// The reference implementation: configuration is pushed in through the
/// setters, watchers observe each push. Used as the test double across
/// the workspace and suitable for embedding.
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<InMemoryState>,
}

impl InMemorySource {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register or replace a vdisk's static configuration.
    pub fn set_vdisk_static_config(&self, vdisk_id: &VdiskId, cfg: VdiskStaticConfig) {
        let mut state = self.state.lock();
        state.vdisks.insert(vdisk_id.as_str().to_owned(), cfg);
    }

    /// Register or update a vdisk's NBD cluster references;
    /// watchers observe the update.
    pub fn set_vdisk_nbd_config(&self, vdisk_id: &VdiskId, cfg: VdiskNbdConfig) {
        let mut state = self.state.lock();
        match state.nbd_configs.get(vdisk_id.as_str()) {
            Some(tx) => {
                let _ = tx.send(cfg);
            }
            None => {
                let (tx, _) = watch::channel(cfg);
                state.nbd_configs.insert(vdisk_id.as_str().to_owned(), tx);
            }
        }
    }

    /// Register or update a storage cluster's configuration;
    /// watchers observe the update.
    pub fn set_storage_cluster_config(&self, cluster_id: &str, cfg: StorageClusterConfig) {
        let mut state = self.state.lock();
        match state.clusters.get(cluster_id) {
            Some(tx) => {
                let _ = tx.send(cfg);
            }
            None => {
                let (tx, _) = watch::channel(cfg);
                state.clusters.insert(cluster_id.to_owned(), tx);
            }
        }
    }

    /// Keys flagged invalid so far, in flagging order.
    #[must_use]
    pub fn invalid_keys(&self) -> Vec<(SourceKey, VdiskId)> {
        self.state.lock().invalid_keys.clone()
    }
}

impl Source for InMemorySource {
    fn read_vdisk_static_config(&self, vdisk_id: &VdiskId) -> Result<VdiskStaticConfig> {
        self.state
            .lock()
            .vdisks
            .get(vdisk_id.as_str())
            .cloned()
            .ok_or_else(|| Error::VdiskNotFound(vdisk_id.to_string()))
    }

    fn read_vdisk_nbd_config(&self, vdisk_id: &VdiskId) -> Result<VdiskNbdConfig> {
        self.state
            .lock()
            .nbd_configs
            .get(vdisk_id.as_str())
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| Error::VdiskNotFound(vdisk_id.to_string()))
    }

    fn read_storage_cluster_config(&self, cluster_id: &str) -> Result<StorageClusterConfig> {
        self.state
            .lock()
            .clusters
            .get(cluster_id)
            .map(|tx| tx.borrow().clone())
            .ok_or_else(|| Error::ClusterNotFound(cluster_id.to_owned()))
    }

    fn watch_vdisk_nbd_config(
        &self,
        vdisk_id: &VdiskId,
    ) -> Result<watch::Receiver<VdiskNbdConfig>> {
        self.state
            .lock()
            .nbd_configs
            .get(vdisk_id.as_str())
            .map(watch::Sender::subscribe)
            .ok_or_else(|| Error::VdiskNotFound(vdisk_id.to_string()))
    }

    fn watch_storage_cluster_config(
        &self,
        cluster_id: &str,
    ) -> Result<watch::Receiver<StorageClusterConfig>> {
        self.state
            .lock()
            .clusters
            .get(cluster_id)
            .map(watch::Sender::subscribe)
            .ok_or_else(|| Error::ClusterNotFound(cluster_id.to_owned()))
    }

    fn mark_invalid_key(&self, key: SourceKey, vdisk_id: &VdiskId) {
        tracing::warn!(key = ?key, vdisk = %vdisk_id, "configuration key marked invalid");
        self.state.lock().invalid_keys.push((key, vdisk_id.clone()));
    }
}
