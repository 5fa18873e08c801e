//! Supervised (hot-reloaded) cluster tests against the in-memory source.

use std::sync::Arc;
use std::time::Duration;

use blockio_ardb::{decode, op, Cluster, Command};
use blockio_common::{
    Error, InMemorySource, LogSink, StorageClusterConfig, VdiskId, VdiskNbdConfig,
};
use blockio_redisstub::StubServer;

fn vdisk(id: &str) -> VdiskId {
    VdiskId::new(id).unwrap()
}

fn cluster_of(servers: &[&StubServer]) -> StorageClusterConfig {
    StorageClusterConfig::new(servers.iter().map(|s| s.server_config()).collect())
}

/// Reloads are applied by a background task; poll until the condition
/// holds or give up loudly.
async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

#[tokio::test]
async fn test_primary_requires_a_known_cluster() {
    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");

    // unknown vdisk
    let result = Cluster::primary(
        vdisk_id.clone(),
        source.clone(),
        Arc::new(LogSink),
        None,
    )
    .await;
    assert!(matches!(result, Err(Error::VdiskNotFound(_))));

    // known vdisk referencing an unknown cluster
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "missing".into(),
            template_cluster_id: None,
        },
    );
    let result = Cluster::primary(
        vdisk_id.clone(),
        source.clone(),
        Arc::new(LogSink),
        None,
    )
    .await;
    assert!(matches!(result, Err(Error::ClusterNotFound(_))));
    assert_eq!(source.invalid_keys().len(), 1);
}

#[tokio::test]
async fn test_primary_serves_and_hot_reloads_membership() {
    let server_a = StubServer::start().await;
    let server_b = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterA".into(),
            template_cluster_id: None,
        },
    );

    let cluster = Cluster::primary(vdisk_id, source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();
    assert_eq!(cluster.server_count(), 1);

    cluster
        .apply_for(0, Command::new(op::SET).arg("k").arg("v").into())
        .await
        .unwrap();
    assert_eq!(server_a.string_value(0, b"k"), Some(b"v".to_vec()));

    // grow the cluster to two servers; the router re-points atomically
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a, &server_b]));
    eventually("membership grows to two servers", || {
        cluster.server_count() == 2
    })
    .await;

    // index 1 now routes to the second server
    cluster
        .apply_for(1, Command::new(op::SET).arg("k1").arg("v1").into())
        .await
        .unwrap();
    assert_eq!(server_b.string_value(0, b"k1"), Some(b"v1".to_vec()));

    cluster.close().await;
}

#[tokio::test]
async fn test_primary_swaps_watchers_on_reference_update() {
    let server_a = StubServer::start().await;
    let server_b = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a]));
    source.set_storage_cluster_config("clusterB", cluster_of(&[&server_b]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterA".into(),
            template_cluster_id: None,
        },
    );

    let cluster = Cluster::primary(vdisk_id.clone(), source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();

    // re-point the vdisk at cluster B
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterB".into(),
            template_cluster_id: None,
        },
    );
    // probe until operations land on cluster B
    let mut landed = false;
    for _ in 0..250 {
        cluster
            .apply_for(0, Command::new(op::SET).arg("probe").arg("x").into())
            .await
            .ok();
        if server_b.string_value(0, b"probe").is_some() {
            landed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(landed, "operations never landed on cluster B");

    // updates to the abandoned cluster A no longer matter
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a, &server_b]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.server_count(), 1);

    cluster.close().await;
}

#[tokio::test]
async fn test_invalid_reference_keeps_previous_membership() {
    let server_a = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterA".into(),
            template_cluster_id: None,
        },
    );

    let cluster = Cluster::primary(vdisk_id.clone(), source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();

    // point the vdisk at a cluster the source does not know
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "missing".into(),
            template_cluster_id: None,
        },
    );
    eventually("the bad reference is flagged", || {
        !source.invalid_keys().is_empty()
    })
    .await;

    // the previous membership keeps serving
    cluster
        .apply_for(0, Command::new(op::SET).arg("still").arg("up").into())
        .await
        .unwrap();
    assert_eq!(server_a.string_value(0, b"still"), Some(b"up".to_vec()));

    cluster.close().await;
}

#[tokio::test]
async fn test_template_cluster_lifecycle() {
    let server_t = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("templateC", cluster_of(&[&server_t]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "ignored".into(),
            template_cluster_id: None,
        },
    );

    // starts detached: defined operations fail ClusterNotDefined
    let cluster = Cluster::template(vdisk_id.clone(), source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();
    assert!(matches!(
        cluster.apply_for(0, Command::new(op::PING).into()).await,
        Err(Error::ClusterNotDefined)
    ));

    // index-less dispatch is never supported on a template cluster
    assert!(matches!(
        cluster.apply(Command::new(op::PING).into()).await,
        Err(Error::MethodNotSupported)
    ));

    // attach a template cluster via hot reload
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "ignored".into(),
            template_cluster_id: Some("templateC".into()),
        },
    );
    eventually("template cluster attaches", || cluster.server_count() == 1).await;

    let reply = cluster
        .apply_for(0, Command::new(op::PING).into())
        .await
        .unwrap();
    assert_eq!(decode::string(reply).unwrap(), "PONG");

    // detach again via an empty reference
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "ignored".into(),
            template_cluster_id: Some(String::new()),
        },
    );
    eventually("template cluster detaches", || cluster.server_count() == 0).await;
    assert!(matches!(
        cluster.apply_for(0, Command::new(op::PING).into()).await,
        Err(Error::ClusterNotDefined)
    ));

    cluster.close().await;
}

#[tokio::test]
async fn test_zero_online_reload_is_rejected() {
    let server_a = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterA".into(),
            template_cluster_id: None,
        },
    );

    let cluster = Cluster::primary(vdisk_id, source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();

    // a config with no online server would make routing spin; it must be
    // ignored and the previous membership retained
    source.set_storage_cluster_config("clusterA", StorageClusterConfig::default());
    tokio::time::sleep(Duration::from_millis(50)).await;

    cluster
        .apply_for(0, Command::new(op::SET).arg("alive").arg("yes").into())
        .await
        .unwrap();
    assert_eq!(server_a.string_value(0, b"alive"), Some(b"yes".to_vec()));

    cluster.close().await;
}

#[tokio::test]
async fn test_close_stops_the_reloader() {
    let server_a = StubServer::start().await;
    let server_b = StubServer::start().await;

    let source = Arc::new(InMemorySource::new());
    let vdisk_id = vdisk("vd1");
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a]));
    source.set_vdisk_nbd_config(
        &vdisk_id,
        VdiskNbdConfig {
            storage_cluster_id: "clusterA".into(),
            template_cluster_id: None,
        },
    );

    let cluster = Cluster::primary(vdisk_id, source.clone(), Arc::new(LogSink), None)
        .await
        .unwrap();
    cluster.close().await;

    // updates after close are not applied
    source.set_storage_cluster_config("clusterA", cluster_of(&[&server_a, &server_b]));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(cluster.server_count(), 1);
}
