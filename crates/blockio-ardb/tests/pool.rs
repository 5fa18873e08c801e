//! Connection pool behavior against the in-memory RESP server.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use blockio_ardb::{op, Action, Command, Connection, Dialer, Pool};
use blockio_common::{Result, StorageServerConfig};
use blockio_redisstub::StubServer;

/// Standard dialer wrapper counting how often it actually dials.
struct CountingDialer {
    dials: AtomicUsize,
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial(&self, cfg: &StorageServerConfig) -> Result<Connection> {
        self.dials.fetch_add(1, Ordering::SeqCst);
        Connection::connect(cfg, Duration::from_secs(1)).await
    }
}

#[tokio::test]
async fn test_healthy_connections_are_recycled() {
    let server = StubServer::start().await;
    let dialer = Arc::new(CountingDialer {
        dials: AtomicUsize::new(0),
    });
    let pool = Pool::new(Some(dialer.clone()));
    let cfg = server.server_config();

    for _ in 0..5 {
        let mut conn = pool.dial(&cfg).await.unwrap();
        conn.apply(&Action::Command(Command::new(op::PING)))
            .await
            .unwrap();
    }

    assert_eq!(dialer.dials.load(Ordering::SeqCst), 1);
    assert_eq!(pool.idle_count(), 1);
}

#[tokio::test]
async fn test_poisoned_connections_are_discarded() {
    let server = StubServer::start().await;
    let dialer = Arc::new(CountingDialer {
        dials: AtomicUsize::new(0),
    });
    let pool = Pool::new(Some(dialer.clone()));
    let cfg = server.server_config();

    {
        let mut conn = pool.dial(&cfg).await.unwrap();
        conn.apply(&Action::Command(Command::new(op::PING)))
            .await
            .unwrap();
        // kill the server mid-lease; the next use poisons the connection
        server.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let result = conn.apply(&Action::Command(Command::new(op::PING))).await;
        assert!(result.is_err());
        assert!(conn.is_broken());
    }

    // the poisoned connection must not have been pooled
    assert_eq!(pool.idle_count(), 0);
}

#[tokio::test]
async fn test_idle_bound_is_enforced() {
    let server = StubServer::start().await;
    let pool = Pool::with_max_idle(None, 2);
    let cfg = server.server_config();

    let mut leases = Vec::new();
    for _ in 0..4 {
        leases.push(pool.dial(&cfg).await.unwrap());
    }
    drop(leases);

    assert_eq!(pool.idle_count(), 2);

    pool.clear();
    assert_eq!(pool.idle_count(), 0);
}
