//! Supervised clusters.
//!
//! Primary and template clusters track their membership through the
//! configuration source: a watch on the vdisk's NBD reference selects
//! which cluster config to follow, and a nested watch follows that
//! cluster's config. Each update re-points the router with one pointer
//! swap; operations snapshot the membership and never hold the lock
//! across i/o.
//!
//! Reload failures are logged (and the offending reference is flagged on
//! the source); the previous membership keeps serving. Failed server
//! operations emit one classified telemetry event, but state transitions
//! come only from the configuration source.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use blockio_common::{
    Error, Result, ServerEvent, ServerEventStatus, ServerRole, Source, SourceKey, SourceKeyKind,
    StorageClusterConfig, StorageServerConfig, TelemetrySink, VdiskId, VdiskNbdConfig,
};

use crate::cluster::{apply_at, grouped_apply_for_all, Cluster, IndexActionPair, StorageServer};
use crate::command::Action;
use crate::conn::Dialer;
use crate::pool::Pool;
use crate::resp::Value;
use crate::routing::{compute_server_index, find_first_server_index};

impl Cluster {
    /// A vdisk's primary cluster, membership hot-reloaded from the
    /// configuration source.
    ///
    /// # Errors
    ///
    /// Fails when the vdisk or its referenced cluster is unknown to the
    /// source, when the reference is empty, or when the initial cluster
    /// config is invalid.
    pub async fn primary(
        vdisk_id: VdiskId,
        source: Arc<dyn Source>,
        sink: Arc<dyn TelemetrySink>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        PrimaryCluster::new(vdisk_id, source, sink, dialer)
            .await
            .map(Self::Primary)
    }

    /// A vdisk's template cluster. Unlike the primary, a template
    /// reference is optional: with no reference the cluster starts
    /// detached and fails operations with `ClusterNotDefined` until a
    /// reload attaches one.
    pub async fn template(
        vdisk_id: VdiskId,
        source: Arc<dyn Source>,
        sink: Arc<dyn TelemetrySink>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        TemplateCluster::new(vdisk_id, source, sink, dialer)
            .await
            .map(Self::Template)
    }
}

struct SupervisedState {
    servers: RwLock<Arc<Vec<StorageServerConfig>>>,
}

impl SupervisedState {
    fn install(&self, vdisk_id: &VdiskId, cfg: StorageClusterConfig) {
        if let Err(err) = cfg.validate() {
            tracing::error!(
                vdisk = %vdisk_id,
                error = %err,
                "ignoring invalid storage cluster config update"
            );
            return;
        }
        *self.servers.write() = Arc::new(cfg.servers);
    }

    fn detach(&self) {
        *self.servers.write() = Arc::new(Vec::new());
    }
}

/// The supervision machinery shared by primary and template clusters
struct SupervisedCluster {
    vdisk_id: VdiskId,
    role: ServerRole,
    state: Arc<SupervisedState>,
    pool: Pool,
    sink: Arc<dyn TelemetrySink>,
    cancel: CancellationToken,
    reloader: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisedCluster {
    async fn new(
        vdisk_id: VdiskId,
        role: ServerRole,
        source: Arc<dyn Source>,
        sink: Arc<dyn TelemetrySink>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        let mut nbd_rx = source.watch_vdisk_nbd_config(&vdisk_id)?;
        let nbd_cfg = nbd_rx.borrow_and_update().clone();

        let mut watcher = ClusterWatcher::default();
        let attached = watcher.set_cluster_id(
            source.as_ref(),
            &vdisk_id,
            cluster_id_for(role, &nbd_cfg),
        )?;

        let servers = if attached {
            let initial = watcher.current().ok_or(Error::ClusterNotDefined)?;
            initial.validate()?;
            initial.servers
        } else {
            if role == ServerRole::Primary {
                return Err(Error::ClusterNotDefined);
            }
            Vec::new()
        };

        let state = Arc::new(SupervisedState {
            servers: RwLock::new(Arc::new(servers)),
        });

        let cancel = CancellationToken::new();
        let reloader = Reloader {
            vdisk_id: vdisk_id.clone(),
            role,
            source,
            state: state.clone(),
            nbd_rx,
            watcher,
        };
        let handle = tokio::spawn(reloader.run(cancel.clone()));

        Ok(Self {
            vdisk_id,
            role,
            state,
            pool: Pool::new(dialer),
            sink,
            cancel,
            reloader: Mutex::new(Some(handle)),
        })
    }

    fn snapshot(&self) -> Arc<Vec<StorageServerConfig>> {
        self.state.servers.read().clone()
    }

    fn emit(&self, cfg: &StorageServerConfig, err: &Error) {
        self.sink.server_event(ServerEvent {
            status: ServerEventStatus::classify(err),
            role: self.role,
            address: cfg.address.clone(),
            database: cfg.database,
            vdisk_id: self.vdisk_id.clone(),
        });
    }

    async fn apply_at(&self, cfg: &StorageServerConfig, action: &Action) -> Result<Value> {
        let result = apply_at(&self.pool, cfg, action).await;
        if let Err(err) = &result {
            self.emit(cfg, err);
        }
        result
    }

    async fn apply_first(&self, action: &Action) -> Result<Value> {
        let servers = self.snapshot();
        let server_index = find_first_server_index(servers.len() as u64, |i| {
            Ok(servers[i as usize].state.is_operational())
        })?;
        self.apply_at(&servers[server_index as usize], action).await
    }

    async fn apply_routed(&self, object_index: u64, action: &Action) -> Result<Value> {
        let servers = self.snapshot();
        let server_index = compute_server_index(servers.len() as u64, object_index, |i| {
            Ok(servers[i as usize].state.is_operational())
        })?;
        self.apply_at(&servers[server_index as usize], action).await
    }

    async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        let servers = self.snapshot();
        grouped_apply_for_all(
            &servers,
            servers.len() as u64,
            &self.pool,
            pairs,
            &|cfg, err| self.emit(cfg, err),
        )
        .await
    }

    fn online_server_count(&self) -> u64 {
        self.snapshot()
            .iter()
            .filter(|cfg| cfg.state.is_operational())
            .count() as u64
    }

    fn online_servers(&self) -> Vec<StorageServer> {
        self.snapshot()
            .iter()
            .filter(|cfg| cfg.state.is_operational())
            .map(|cfg| StorageServer::ardb(cfg.clone(), self.pool.clone()))
            .collect()
    }

    async fn close(&self) {
        self.cancel.cancel();
        let handle = self.reloader.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.pool.clear();
    }
}

impl Drop for SupervisedCluster {
    fn drop(&mut self) {
        // the reload task holds no strong reference back to this cluster,
        // tripping the token is enough to end it
        self.cancel.cancel();
    }
}

/// A vdisk's primary cluster with hot-reloaded membership
pub struct PrimaryCluster {
    inner: SupervisedCluster,
}

impl PrimaryCluster {
    pub(crate) async fn new(
        vdisk_id: VdiskId,
        source: Arc<dyn Source>,
        sink: Arc<dyn TelemetrySink>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        SupervisedCluster::new(vdisk_id, ServerRole::Primary, source, sink, dialer)
            .await
            .map(|inner| Self { inner })
    }

    pub(crate) async fn apply(&self, action: &Action) -> Result<Value> {
        self.inner.apply_first(action).await
    }

    pub(crate) async fn apply_for(&self, object_index: u64, action: &Action) -> Result<Value> {
        self.inner.apply_routed(object_index, action).await
    }

    pub(crate) async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        self.inner.apply_for_all(pairs).await
    }

    pub(crate) fn online_server_count(&self) -> u64 {
        self.inner.online_server_count()
    }

    pub(crate) fn online_servers(&self) -> Vec<StorageServer> {
        self.inner.online_servers()
    }

    pub(crate) async fn close(&self) {
        self.inner.close().await;
    }
}

/// A vdisk's template cluster (attached or not) with hot-reloaded
/// membership. Index-less dispatch is not meaningful on a template
/// cluster and is rejected.
pub struct TemplateCluster {
    inner: SupervisedCluster,
}

impl TemplateCluster {
    pub(crate) async fn new(
        vdisk_id: VdiskId,
        source: Arc<dyn Source>,
        sink: Arc<dyn TelemetrySink>,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        SupervisedCluster::new(vdisk_id, ServerRole::Template, source, sink, dialer)
            .await
            .map(|inner| Self { inner })
    }

    pub(crate) async fn apply(&self, _action: &Action) -> Result<Value> {
        Err(Error::MethodNotSupported)
    }

    pub(crate) async fn apply_for(&self, object_index: u64, action: &Action) -> Result<Value> {
        if self.inner.snapshot().is_empty() {
            return Err(Error::ClusterNotDefined);
        }
        self.inner.apply_routed(object_index, action).await
    }

    pub(crate) async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        if pairs.is_empty() {
            return Ok(Vec::new());
        }
        if self.inner.snapshot().is_empty() {
            return Err(Error::ClusterNotDefined);
        }
        self.inner.apply_for_all(pairs).await
    }

    pub(crate) fn online_server_count(&self) -> u64 {
        self.inner.online_server_count()
    }

    pub(crate) fn online_servers(&self) -> Vec<StorageServer> {
        self.inner.online_servers()
    }

    pub(crate) async fn close(&self) {
        self.inner.close().await;
    }
}

fn cluster_id_for(role: ServerRole, cfg: &VdiskNbdConfig) -> Option<&str> {
    match role {
        ServerRole::Primary => Some(cfg.storage_cluster_id.as_str()),
        ServerRole::Template => cfg.template_cluster_id.as_deref(),
    }
}

/// (Un)sets the nested storage-cluster watch for a cluster ID.
///
/// Setting the same ID twice is a no-op; setting an empty ID drops the
/// watch; swapping to a new ID opens the new watch before the old one is
/// dropped, and on failure flags the vdisk's NBD reference as invalid and
/// leaves the old watch in place.
#[derive(Default)]
struct ClusterWatcher {
    cluster_id: Option<String>,
    rx: Option<watch::Receiver<StorageClusterConfig>>,
}

impl ClusterWatcher {
    fn attached(&self) -> bool {
        self.rx.is_some()
    }

    fn set_cluster_id(
        &mut self,
        source: &dyn Source,
        vdisk_id: &VdiskId,
        cluster_id: Option<&str>,
    ) -> Result<bool> {
        let cluster_id = cluster_id.filter(|id| !id.is_empty());
        if self.cluster_id.as_deref() == cluster_id {
            return Ok(self.attached());
        }

        let Some(id) = cluster_id else {
            self.cluster_id = None;
            self.rx = None;
            return Ok(false);
        };

        match source.watch_storage_cluster_config(id) {
            Ok(rx) => {
                self.cluster_id = Some(id.to_owned());
                self.rx = Some(rx);
                Ok(true)
            }
            Err(err) => {
                source.mark_invalid_key(
                    SourceKey::new(vdisk_id.as_str(), SourceKeyKind::VdiskNbd),
                    vdisk_id,
                );
                Err(err)
            }
        }
    }

    fn current(&mut self) -> Option<StorageClusterConfig> {
        self.rx.as_mut().map(|rx| rx.borrow_and_update().clone())
    }

    /// Wait for the next config update on the nested watch;
    /// pends forever while detached.
    async fn changed(&mut self) -> StorageClusterConfig {
        match &mut self.rx {
            Some(rx) => {
                if rx.changed().await.is_ok() {
                    rx.borrow_and_update().clone()
                } else {
                    std::future::pending().await
                }
            }
            None => std::future::pending().await,
        }
    }
}

/// The reload task owned by a supervised cluster
struct Reloader {
    vdisk_id: VdiskId,
    role: ServerRole,
    source: Arc<dyn Source>,
    state: Arc<SupervisedState>,
    nbd_rx: watch::Receiver<VdiskNbdConfig>,
    watcher: ClusterWatcher,
}

impl Reloader {
    async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,

                // the vdisk's cluster reference changed
                changed = self.nbd_rx.changed() => {
                    if changed.is_err() {
                        // the source dropped the vdisk, nothing to track
                        return;
                    }
                    let nbd_cfg = self.nbd_rx.borrow_and_update().clone();
                    self.reference_update(&nbd_cfg);
                }

                // the tracked cluster's config changed
                cfg = self.watcher.changed() => {
                    self.state.install(&self.vdisk_id, cfg);
                }
            }
        }
    }

    fn reference_update(&mut self, nbd_cfg: &VdiskNbdConfig) {
        let was_attached = self.watcher.attached();
        let cluster_id = cluster_id_for(self.role, nbd_cfg).map(str::to_owned);
        match self
            .watcher
            .set_cluster_id(self.source.as_ref(), &self.vdisk_id, cluster_id.as_deref())
        {
            Ok(true) => {
                if let Some(cfg) = self.watcher.current() {
                    self.state.install(&self.vdisk_id, cfg);
                }
            }
            Ok(false) => {
                if was_attached {
                    tracing::info!(vdisk = %self.vdisk_id, role = ?self.role, "cluster reference removed, detaching");
                    self.state.detach();
                }
            }
            Err(err) => {
                // previous membership keeps serving
                tracing::error!(
                    vdisk = %self.vdisk_id,
                    role = ?self.role,
                    error = %err,
                    "failed to watch new storage cluster config"
                );
            }
        }
    }
}
