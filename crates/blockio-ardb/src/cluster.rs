//! Storage clusters.
//!
//! A [`Cluster`] dispatches storage actions onto one server of a sharded
//! ARDB cluster. The flavors form a closed set:
//!
//! - [`UniCluster`]: exactly one server, routing ignores the index
//! - [`StaticCluster`]: multi-server, membership fixed at construction
//! - [`PrimaryCluster`] / [`TemplateCluster`]: membership hot-reloaded
//!   from the configuration source (see [`crate::supervised`])
//! - [`ErrorCluster`] / [`NopCluster`]: trivial flavors for composition
//!
//! All flavors share the routing functions in [`crate::routing`]; none of
//! them fails over between servers on its own — a transport error on the
//! routed server surfaces to the caller.

use std::collections::HashMap;

use blockio_common::{Error, Result, ServerState, StorageClusterConfig, StorageServerConfig};

use crate::command::Action;
use crate::conn::Dialer;
use crate::pool::Pool;
use crate::resp::Value;
use crate::routing::{compute_server_index, find_first_server_index};
use crate::supervised::{PrimaryCluster, TemplateCluster};

use std::sync::Arc;

/// An object index paired with the action to run on its server
#[derive(Clone, Debug)]
pub struct IndexActionPair {
    pub index: u64,
    pub action: Action,
}

impl IndexActionPair {
    #[must_use]
    pub fn new(index: u64, action: impl Into<Action>) -> Self {
        Self {
            index,
            action: action.into(),
        }
    }
}

/// A cluster of ARDB storage servers addressed together
pub enum Cluster {
    Uni(UniCluster),
    Static(StaticCluster),
    Primary(PrimaryCluster),
    Template(TemplateCluster),
    Error(ErrorCluster),
    Nop(NopCluster),
}

impl Cluster {
    /// A cluster of exactly one server.
    ///
    /// # Errors
    ///
    /// `NoServersAvailable` when the server is retired,
    /// `ServerStateNotSupported` for any state other than online/RIP.
    pub fn uni(cfg: StorageServerConfig, dialer: Option<Arc<dyn Dialer>>) -> Result<Self> {
        UniCluster::new(cfg, dialer).map(Self::Uni)
    }

    /// A multi-server cluster with membership fixed at construction.
    ///
    /// # Errors
    ///
    /// `NoServersAvailable` when no server is online,
    /// `ServerStateNotSupported` when any server is in a state other than
    /// online/RIP.
    pub fn fixed(cfg: StorageClusterConfig, dialer: Option<Arc<dyn Dialer>>) -> Result<Self> {
        StaticCluster::new(cfg, dialer).map(Self::Static)
    }

    /// A cluster that fails every operation with the given error.
    #[must_use]
    pub fn failing(error: Error) -> Self {
        Self::Error(ErrorCluster { error })
    }

    /// A cluster that succeeds every operation returning no content.
    #[must_use]
    pub fn nop() -> Self {
        Self::Nop(NopCluster)
    }

    /// Apply an action to the first operational server.
    pub async fn apply(&self, action: Action) -> Result<Value> {
        match self {
            Self::Uni(c) => c.apply(&action).await,
            Self::Static(c) => c.apply(&action).await,
            Self::Primary(c) => c.apply(&action).await,
            Self::Template(c) => c.apply(&action).await,
            Self::Error(c) => Err(c.error.clone()),
            Self::Nop(_) => Ok(Value::Nil),
        }
    }

    /// Apply an action to the server the routing function selects for
    /// `object_index`.
    pub async fn apply_for(&self, object_index: u64, action: Action) -> Result<Value> {
        match self {
            Self::Uni(c) => c.apply(&action).await,
            Self::Static(c) => c.apply_for(object_index, &action).await,
            Self::Primary(c) => c.apply_for(object_index, &action).await,
            Self::Template(c) => c.apply_for(object_index, &action).await,
            Self::Error(c) => Err(c.error.clone()),
            Self::Nop(_) => Ok(Value::Nil),
        }
    }

    /// Apply every pair on the server its index maps to.
    ///
    /// Pairs routed to the same server coalesce into one pipelined batch;
    /// distinct-server batches run concurrently. The returned replies are
    /// in input order. On any batch error the first error is returned,
    /// remaining batches are cancelled, and no partial replies escape.
    pub async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        match self {
            Self::Uni(c) => c.apply_for_all(pairs).await,
            Self::Static(c) => c.apply_for_all(pairs).await,
            Self::Primary(c) => c.apply_for_all(pairs).await,
            Self::Template(c) => c.apply_for_all(pairs).await,
            Self::Error(c) => Err(c.error.clone()),
            Self::Nop(_) => Ok(vec![Value::Nil; pairs.len()]),
        }
    }

    /// Snapshot of the currently operational servers.
    pub fn servers(&self) -> Result<Vec<StorageServer>> {
        match self {
            Self::Uni(c) => Ok(vec![StorageServer::ardb(
                c.server.clone(),
                c.pool.clone(),
            )]),
            Self::Static(c) => Ok(c.online_servers()),
            Self::Primary(c) => Ok(c.online_servers()),
            Self::Template(c) => Ok(c.online_servers()),
            Self::Error(c) => Err(c.error.clone()),
            Self::Nop(_) => Ok(vec![StorageServer::nop()]),
        }
    }

    /// Number of currently operational servers.
    #[must_use]
    pub fn server_count(&self) -> u64 {
        match self {
            Self::Uni(_) | Self::Nop(_) => 1,
            Self::Static(c) => c.available_server_count,
            Self::Primary(c) => c.online_server_count(),
            Self::Template(c) => c.online_server_count(),
            Self::Error(_) => 0,
        }
    }

    /// Tear the cluster down: cancel any supervision and drain pooled
    /// connections. Idempotent.
    pub async fn close(&self) {
        match self {
            Self::Uni(c) => c.pool.clear(),
            Self::Static(c) => c.pool.clear(),
            Self::Primary(c) => c.close().await,
            Self::Template(c) => c.close().await,
            Self::Error(_) | Self::Nop(_) => {}
        }
    }
}

/// One reachable server of a cluster, as yielded by [`Cluster::servers`]
pub struct StorageServer {
    kind: ServerKind,
}

enum ServerKind {
    Ardb {
        cfg: StorageServerConfig,
        pool: Pool,
    },
    Nop,
}

impl StorageServer {
    pub(crate) fn ardb(cfg: StorageServerConfig, pool: Pool) -> Self {
        Self {
            kind: ServerKind::Ardb { cfg, pool },
        }
    }

    pub(crate) fn nop() -> Self {
        Self {
            kind: ServerKind::Nop,
        }
    }

    /// Apply an action to this server.
    pub async fn apply(&self, action: &Action) -> Result<Value> {
        match &self.kind {
            ServerKind::Ardb { cfg, pool } => apply_at(pool, cfg, action).await,
            ServerKind::Nop => Ok(Value::Nil),
        }
    }

    /// The server's configuration; `None` for synthetic servers.
    #[must_use]
    pub fn config(&self) -> Option<&StorageServerConfig> {
        match &self.kind {
            ServerKind::Ardb { cfg, .. } => Some(cfg),
            ServerKind::Nop => None,
        }
    }
}

/// A cluster with exactly one configured server
pub struct UniCluster {
    server: StorageServerConfig,
    pool: Pool,
}

impl UniCluster {
    pub(crate) fn new(cfg: StorageServerConfig, dialer: Option<Arc<dyn Dialer>>) -> Result<Self> {
        cfg.validate()?;
        match cfg.state {
            ServerState::Online => {}
            ServerState::Rip => return Err(Error::NoServersAvailable),
            _ => return Err(Error::ServerStateNotSupported),
        }
        Ok(Self {
            server: cfg,
            pool: Pool::new(dialer),
        })
    }

    async fn apply(&self, action: &Action) -> Result<Value> {
        apply_at(&self.pool, &self.server, action).await
    }

    async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        match pairs.as_slice() {
            [] => Ok(Vec::new()),
            [pair] => Ok(vec![self.apply(&pair.action).await?]),
            _ => {
                let actions: Vec<Action> = pairs.into_iter().map(|pair| pair.action).collect();
                let mut conn = self.pool.dial(&self.server).await?;
                conn.apply_all(&actions).await
            }
        }
    }
}

/// A multi-server cluster with membership fixed at construction
pub struct StaticCluster {
    servers: Vec<StorageServerConfig>,
    /// Full length of the routing space, retired slots included
    server_count: u64,
    available_server_count: u64,
    pool: Pool,
}

impl StaticCluster {
    pub(crate) fn new(
        cfg: StorageClusterConfig,
        dialer: Option<Arc<dyn Dialer>>,
    ) -> Result<Self> {
        cfg.validate()?;
        let server_count = cfg.server_count();
        let available_server_count = cfg.available_server_count();
        Ok(Self {
            servers: cfg.servers,
            server_count,
            available_server_count,
            pool: Pool::new(dialer),
        })
    }

    fn operational(&self, server_index: u64) -> Result<bool> {
        // the constructor guarantees every state is online or RIP
        Ok(self.servers[server_index as usize].state.is_operational())
    }

    async fn apply(&self, action: &Action) -> Result<Value> {
        let server_index =
            find_first_server_index(self.server_count, |i| self.operational(i))?;
        apply_at(&self.pool, &self.servers[server_index as usize], action).await
    }

    async fn apply_for(&self, object_index: u64, action: &Action) -> Result<Value> {
        let server_index =
            compute_server_index(self.server_count, object_index, |i| self.operational(i))?;
        apply_at(&self.pool, &self.servers[server_index as usize], action).await
    }

    async fn apply_for_all(&self, pairs: Vec<IndexActionPair>) -> Result<Vec<Value>> {
        grouped_apply_for_all(&self.servers, self.server_count, &self.pool, pairs, &|_, _| {})
            .await
    }

    fn online_servers(&self) -> Vec<StorageServer> {
        self.servers
            .iter()
            .filter(|cfg| cfg.state.is_operational())
            .map(|cfg| StorageServer::ardb(cfg.clone(), self.pool.clone()))
            .collect()
    }
}

/// A cluster that fails every operation with one fixed error
pub struct ErrorCluster {
    pub(crate) error: Error,
}

/// A cluster that succeeds every operation returning no content
pub struct NopCluster;

pub(crate) async fn apply_at(
    pool: &Pool,
    cfg: &StorageServerConfig,
    action: &Action,
) -> Result<Value> {
    let mut conn = pool.dial(cfg).await?;
    conn.apply(action).await
}

/// Batched dispatch shared by the multi-server flavors.
///
/// Routes every pair with [`compute_server_index`], coalesces per-server
/// groups into pipelined batches, runs distinct-server batches
/// concurrently, and re-indexes the replies into input order. The first
/// failing batch cancels the remaining ones; `on_server_error` observes
/// each batch failure (supervised clusters emit telemetry through it).
pub(crate) async fn grouped_apply_for_all(
    servers: &[StorageServerConfig],
    server_count: u64,
    pool: &Pool,
    pairs: Vec<IndexActionPair>,
    on_server_error: &(dyn Fn(&StorageServerConfig, &Error) + Send + Sync),
) -> Result<Vec<Value>> {
    let operational =
        |i: u64| -> Result<bool> { Ok(servers[i as usize].state.is_operational()) };

    match pairs.as_slice() {
        [] => return Ok(Vec::new()),
        [pair] => {
            let server_index = compute_server_index(server_count, pair.index, operational)?;
            let cfg = &servers[server_index as usize];
            let reply = apply_at(pool, cfg, &pair.action).await.map_err(|err| {
                on_server_error(cfg, &err);
                err
            })?;
            return Ok(vec![reply]);
        }
        _ => {}
    }

    // sort the actions per routed server, remembering each action's
    // position so the replies can be re-indexed into input order
    struct ServerBatch {
        positions: Vec<usize>,
        actions: Vec<Action>,
    }

    let pair_count = pairs.len();
    let mut batches: HashMap<u64, ServerBatch> = HashMap::new();
    for (position, pair) in pairs.into_iter().enumerate() {
        let server_index = compute_server_index(server_count, pair.index, operational)?;
        let batch = batches.entry(server_index).or_insert_with(|| ServerBatch {
            positions: Vec::new(),
            actions: Vec::new(),
        });
        batch.positions.push(position);
        batch.actions.push(pair.action);
    }

    let results = futures::future::try_join_all(batches.into_iter().map(
        |(server_index, batch)| {
            let cfg = &servers[server_index as usize];
            let pool = pool.clone();
            async move {
                let replies = async {
                    let mut conn = pool.dial(cfg).await?;
                    conn.apply_all(&batch.actions).await
                }
                .await
                .map_err(|err| {
                    on_server_error(cfg, &err);
                    err
                })?;
                Ok::<_, Error>((batch.positions, replies))
            }
        },
    ))
    .await?;

    let mut replies = vec![Value::Nil; pair_count];
    for (positions, server_replies) in results {
        if positions.len() != server_replies.len() {
            return Err(Error::protocol(format!(
                "expected {} replies from batch, got {}",
                positions.len(),
                server_replies.len()
            )));
        }
        for (position, reply) in positions.into_iter().zip(server_replies) {
            replies[position] = reply;
        }
    }
    Ok(replies)
}
