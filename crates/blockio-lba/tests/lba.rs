//! LBA store integration tests against the in-memory RESP server.

use std::sync::Arc;

use blockio_common::{BlockHash, VdiskId, HASH_SIZE};
use blockio_lba::{Lba, BYTES_PER_SHARD, RECORDS_PER_SHARD};
use blockio_redisstub::StubServer;

use blockio_ardb::Cluster;

const META_KEY: &[u8] = b"meta:vd1";

fn vdisk() -> VdiskId {
    VdiskId::new("vd1").unwrap()
}

async fn meta_cluster(server: &StubServer) -> Arc<Cluster> {
    Arc::new(Cluster::uni(server.server_config(), None).unwrap())
}

#[tokio::test]
async fn test_get_of_unknown_index_is_nil() {
    let server = StubServer::start().await;
    let lba = Lba::new(&vdisk(), meta_cluster(&server).await);

    assert!(lba.get(0).await.unwrap().is_nil());
    assert!(lba.get(12_345).await.unwrap().is_nil());
}

#[tokio::test]
async fn test_flush_writes_one_shard_record() {
    let server = StubServer::start().await;
    let lba = Lba::new(&vdisk(), meta_cluster(&server).await);

    // slot 7 of shard 3
    let hash = BlockHash::of(b"block content");
    let block_index = 3 * RECORDS_PER_SHARD as u64 + 7;
    lba.set(block_index, hash).await.unwrap();

    // nothing hits the wire before the flush
    assert_eq!(server.hash_len(0, META_KEY), 0);

    lba.flush().await.unwrap();

    let payload = server.hash_field(0, META_KEY, b"3").unwrap();
    assert_eq!(payload.len(), BYTES_PER_SHARD);
    assert_eq!(&payload[7 * HASH_SIZE..8 * HASH_SIZE], hash.as_bytes());
    for (slot, chunk) in payload.chunks(HASH_SIZE).enumerate() {
        if slot != 7 {
            assert!(chunk.iter().all(|&b| b == 0), "slot {slot} not zero");
        }
    }

    // clearing the slot back to nil turns the next flush into a delete
    lba.delete(block_index).await.unwrap();
    lba.flush().await.unwrap();
    assert_eq!(server.hash_field(0, META_KEY, b"3"), None);
    // the last field's delete removed the meta key itself
    assert_eq!(server.key_count(0), 0);
}

#[tokio::test]
async fn test_mapping_survives_reload() {
    let server = StubServer::start().await;
    let cluster = meta_cluster(&server).await;

    let first = Lba::new(&vdisk(), cluster.clone());
    let hash_a = BlockHash::of(b"a");
    let hash_b = BlockHash::of(b"b");
    first.set(1, hash_a).await.unwrap();
    first.set(129, hash_b).await.unwrap();
    first.flush().await.unwrap();

    // a fresh store sees the flushed state
    let second = Lba::new(&vdisk(), cluster);
    assert_eq!(second.get(1).await.unwrap(), hash_a);
    assert_eq!(second.get(129).await.unwrap(), hash_b);
    assert!(second.get(2).await.unwrap().is_nil());
}

#[tokio::test]
async fn test_flush_fans_out_all_dirty_shards() {
    let server = StubServer::start().await;
    let lba = Lba::new(&vdisk(), meta_cluster(&server).await);

    for shard_index in 0..8u64 {
        lba.set(shard_index * RECORDS_PER_SHARD as u64, BlockHash::of(b"x"))
            .await
            .unwrap();
    }
    lba.flush().await.unwrap();
    assert_eq!(server.hash_len(0, META_KEY), 8);

    // a second flush with nothing dirty writes nothing
    server.close();
    lba.flush().await.unwrap();
}

#[tokio::test]
async fn test_eviction_flushes_dirty_victims() {
    let server = StubServer::start().await;
    // budget of exactly one shard
    let lba = Lba::with_cache_limit(&vdisk(), meta_cluster(&server).await, BYTES_PER_SHARD);

    let hash = BlockHash::of(b"victim");
    lba.set(0, hash).await.unwrap();

    // loading shard 1 evicts dirty shard 0, which must be flushed first
    lba.set(RECORDS_PER_SHARD as u64, BlockHash::of(b"other"))
        .await
        .unwrap();

    assert_eq!(lba.resident_shards().await, 1);
    let payload = server.hash_field(0, META_KEY, b"0").unwrap();
    assert_eq!(&payload[..HASH_SIZE], hash.as_bytes());

    // the evicted mapping reloads on demand
    assert_eq!(lba.get(0).await.unwrap(), hash);
}
