//! Connection pool.
//!
//! Pools idle connections keyed by `(address, database)`. A lease is an
//! RAII guard: dropping it returns a healthy connection to the pool and
//! discards a poisoned one. The pool is bounded per key; excess idle
//! connections are closed instead of pooled.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use blockio_common::{Result, StorageServerConfig};

use crate::conn::{Connection, Dialer, StandardDialer};

/// Default bound on idle connections kept per server
pub const DEFAULT_MAX_IDLE_PER_SERVER: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PoolKey {
    address: String,
    database: i64,
}

impl PoolKey {
    fn of(cfg: &StorageServerConfig) -> Self {
        Self {
            address: cfg.address.clone(),
            database: cfg.database,
        }
    }
}

struct PoolInner {
    dialer: Arc<dyn Dialer>,
    max_idle_per_server: usize,
    idle: Mutex<HashMap<PoolKey, Vec<Connection>>>,
}

/// A bounded, thread-safe pool of connections to ARDB servers.
///
/// Cloning is cheap and clones share the pooled connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with the standard dialer, or the given one.
    #[must_use]
    pub fn new(dialer: Option<Arc<dyn Dialer>>) -> Self {
        Self::with_max_idle(dialer, DEFAULT_MAX_IDLE_PER_SERVER)
    }

    /// Create a pool bounding idle connections per server to `max_idle`.
    #[must_use]
    pub fn with_max_idle(dialer: Option<Arc<dyn Dialer>>, max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                dialer: dialer.unwrap_or_else(|| Arc::new(StandardDialer::default())),
                max_idle_per_server: max_idle,
                idle: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Lease a connection to the configured server, reusing an idle one
    /// when available.
    ///
    /// # Errors
    ///
    /// Dial errors are surfaced verbatim; the pool performs no retry.
    pub async fn dial(&self, cfg: &StorageServerConfig) -> Result<PooledConnection> {
        let key = PoolKey::of(cfg);
        let reused = self.inner.idle.lock().get_mut(&key).and_then(Vec::pop);
        let conn = match reused {
            Some(conn) => conn,
            None => self.inner.dialer.dial(cfg).await?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            key,
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Drop every idle connection.
    pub fn clear(&self) {
        self.inner.idle.lock().clear();
    }

    /// Number of idle connections currently pooled.
    #[must_use]
    pub fn idle_count(&self) -> usize {
        self.inner.idle.lock().values().map(Vec::len).sum()
    }
}

/// An exclusive lease on a pooled connection
pub struct PooledConnection {
    conn: Option<Connection>,
    key: PoolKey,
    pool: Weak<PoolInner>,
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken before drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken before drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        if conn.is_broken() {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            let mut idle = pool.idle.lock();
            let slot = idle.entry(self.key.clone()).or_default();
            if slot.len() < pool.max_idle_per_server {
                slot.push(conn);
            }
        }
    }
}
