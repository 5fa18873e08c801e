//! End-to-end export/import tests over the in-memory RESP server and the
//! in-memory backup store.

use std::sync::Arc;

use rand::RngCore;

use blockio_ardb::Cluster;
use blockio_backup::{
    block_path, export_vdisk, import_vdisk, map_path, BackupConfig, BackupError, CompressionType,
    Crypter, CryptoKey, MemoryDriver,
};
use blockio_common::{
    BlockHash, BlockSize, InMemorySource, Source, StorageClusterConfig, VdiskId, VdiskNbdConfig,
    VdiskStaticConfig, VdiskType,
};
use blockio_redisstub::StubServer;
use blockio_storage::{BlockStorage, BlockStorageConfig};

const VDISK_BLOCK_SIZE: u32 = 512;
const SNAPSHOT_BLOCK_SIZE: u32 = 2048;

struct Fixture {
    source: Arc<InMemorySource>,
    driver: Arc<MemoryDriver>,
    // kept alive for the duration of the test
    servers: Vec<StubServer>,
}

impl Fixture {
    async fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        Self {
            source: Arc::new(InMemorySource::new()),
            driver: Arc::new(MemoryDriver::new()),
            servers: Vec::new(),
        }
    }

    /// Register a vdisk backed by its own fresh stub cluster.
    async fn add_vdisk(&mut self, id: &str, vdisk_type: VdiskType) -> VdiskId {
        let vdisk_id = VdiskId::new(id).unwrap();
        let server = StubServer::start().await;
        let cluster_id = format!("cluster-{id}");
        self.source.set_storage_cluster_config(
            &cluster_id,
            StorageClusterConfig::new(vec![server.server_config()]),
        );
        self.source.set_vdisk_nbd_config(
            &vdisk_id,
            VdiskNbdConfig {
                storage_cluster_id: cluster_id,
                template_cluster_id: None,
            },
        );
        self.source.set_vdisk_static_config(
            &vdisk_id,
            VdiskStaticConfig {
                vdisk_type,
                block_size: BlockSize::new(VDISK_BLOCK_SIZE).unwrap(),
                template_vdisk_id: None,
            },
        );
        self.servers.push(server);
        vdisk_id
    }

    /// Open the vdisk's block storage the way the pipeline does.
    fn storage(&self, vdisk_id: &VdiskId) -> BlockStorage {
        let static_cfg = self.source.read_vdisk_static_config(vdisk_id).unwrap();
        let nbd = self.source.read_vdisk_nbd_config(vdisk_id).unwrap();
        let cluster_cfg = self
            .source
            .read_storage_cluster_config(&nbd.storage_cluster_id)
            .unwrap();
        let cluster = Arc::new(Cluster::fixed(cluster_cfg, None).unwrap());
        BlockStorage::new(
            BlockStorageConfig::new(vdisk_id.clone(), static_cfg.vdisk_type, static_cfg.block_size),
            cluster,
            None,
        )
    }

    fn config(&self, vdisk_id: &VdiskId, key: &CryptoKey) -> BackupConfig {
        let mut cfg = BackupConfig::new(vdisk_id.clone(), key.clone());
        cfg.snapshot_id = Some("snap".into());
        cfg.block_size = Some(BlockSize::new(SNAPSHOT_BLOCK_SIZE).unwrap());
        cfg.job_count = 4;
        cfg
    }
}

fn random_block() -> Vec<u8> {
    let mut block = vec![0u8; VDISK_BLOCK_SIZE as usize];
    rand::thread_rng().fill_bytes(&mut block);
    block
}

/// Sparse indices spanning several snapshot-block spans.
const BLOCK_INDICES: [u64; 7] = [0, 1, 3, 4, 9, 10, 40];

async fn populate(storage: &BlockStorage) -> Vec<(u64, Vec<u8>)> {
    let mut blocks = Vec::new();
    for &index in &BLOCK_INDICES {
        let block = random_block();
        storage.set_block(index, &block).await.unwrap();
        blocks.push((index, block));
    }
    storage.flush().await.unwrap();
    blocks
}

#[tokio::test]
async fn test_export_import_roundtrip_nondeduped() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let dst_vdisk = fixture.add_vdisk("dst", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();

    let blocks = populate(&fixture.storage(&src_vdisk)).await;

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    assert!(fixture.driver.object(&map_path("snap")).is_some());

    import_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&dst_vdisk, &key),
    )
    .await
    .unwrap();

    let restored = fixture.storage(&dst_vdisk);
    for (index, block) in &blocks {
        let read = restored.get_block(*index).await.unwrap().unwrap();
        assert_eq!(&read[..], &block[..], "block {index} corrupted");
    }
}

#[tokio::test]
async fn test_export_import_roundtrip_deduped() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::Deduped).await;
    let dst_vdisk = fixture.add_vdisk("dst", VdiskType::Deduped).await;
    let key = CryptoKey::random();

    let blocks = populate(&fixture.storage(&src_vdisk)).await;

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();
    import_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&dst_vdisk, &key),
    )
    .await
    .unwrap();

    let restored = fixture.storage(&dst_vdisk);
    for (index, block) in &blocks {
        let read = restored.get_block(*index).await.unwrap().unwrap();
        assert_eq!(&read[..], &block[..], "block {index} corrupted");
    }
}

#[tokio::test]
async fn test_identical_blocks_store_once() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();

    // the same snapshot-sized span content at several spans
    let storage = fixture.storage(&src_vdisk);
    let block = random_block();
    for span in [0u64, 4, 8, 12] {
        storage.set_block(span * 4, &block).await.unwrap();
    }

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    // one map object plus exactly one content object
    assert_eq!(fixture.driver.len(), 2);
}

#[tokio::test]
async fn test_export_is_idempotent() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();
    populate(&fixture.storage(&src_vdisk)).await;

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();
    let paths = fixture.driver.paths();
    let first_map = fixture.driver.object(&map_path("snap")).unwrap();

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    // same object set, and the maps differ only in their crypto nonce
    assert_eq!(fixture.driver.paths(), paths);
    let second_map = fixture.driver.object(&map_path("snap")).unwrap();
    let crypter = Crypter::new(&key).unwrap();
    assert_eq!(
        crypter.decrypt(&first_map).unwrap(),
        crypter.decrypt(&second_map).unwrap()
    );
}

#[tokio::test]
async fn test_import_of_unknown_snapshot_fails() {
    let mut fixture = Fixture::new().await;
    let dst_vdisk = fixture.add_vdisk("dst", VdiskType::NonDeduped).await;

    let result = import_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&dst_vdisk, &CryptoKey::random()),
    )
    .await;
    assert!(matches!(result, Err(BackupError::SnapshotNotFound(_))));
}

#[tokio::test]
async fn test_wrong_key_fails_import_and_force_recovers_export() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();
    populate(&fixture.storage(&src_vdisk)).await;

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    // the wrong key can neither import...
    let wrong_key = CryptoKey::random();
    let result = import_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &wrong_key),
    )
    .await;
    assert!(matches!(result, Err(BackupError::Decrypt(_))));

    // ...nor re-export over the existing snapshot
    let result = export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &wrong_key),
    )
    .await;
    assert!(matches!(result, Err(BackupError::Decrypt(_))));

    // unless forced, which starts a fresh deduped map
    let mut forced = fixture.config(&src_vdisk, &wrong_key);
    forced.force = true;
    export_vdisk(fixture.source.clone(), fixture.driver.clone(), forced)
        .await
        .unwrap();

    // the freshly written map opens under the new key
    let map_bytes = fixture.driver.object(&map_path("snap")).unwrap();
    assert!(Crypter::new(&wrong_key).unwrap().decrypt(&map_bytes).is_ok());
}

#[tokio::test]
async fn test_corrupted_block_fails_the_import() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let dst_vdisk = fixture.add_vdisk("dst", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();
    populate(&fixture.storage(&src_vdisk)).await;

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    // replace one stored block with validly-sealed different content:
    // crypto and compression open fine, the content hash does not match
    let block_paths: Vec<String> = fixture
        .driver
        .paths()
        .into_iter()
        .filter(|path| path != &map_path("snap"))
        .collect();
    let crypter = Crypter::new(&key).unwrap();
    let forged = crypter
        .encrypt(
            &CompressionType::default()
                .compress(&vec![0xABu8; SNAPSHOT_BLOCK_SIZE as usize])
                .unwrap(),
        )
        .unwrap();
    fixture.driver.insert_object(block_paths[0].clone(), forged);

    let result = import_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&dst_vdisk, &key),
    )
    .await;
    assert!(matches!(result, Err(BackupError::HashMismatch { .. })));
}

#[tokio::test]
async fn test_block_objects_use_hash_derived_paths() {
    let mut fixture = Fixture::new().await;
    let src_vdisk = fixture.add_vdisk("src", VdiskType::NonDeduped).await;
    let key = CryptoKey::random();

    // one full snapshot span of known content
    let storage = fixture.storage(&src_vdisk);
    let mut span = Vec::new();
    for index in 0..4u64 {
        let block = vec![index as u8 + 1; VDISK_BLOCK_SIZE as usize];
        storage.set_block(index, &block).await.unwrap();
        span.extend_from_slice(&block);
    }

    export_vdisk(
        fixture.source.clone(),
        fixture.driver.clone(),
        fixture.config(&src_vdisk, &key),
    )
    .await
    .unwrap();

    let expected = block_path("snap", &BlockHash::of(&span));
    assert!(
        fixture.driver.object(&expected).is_some(),
        "missing block object at {expected}, have {:?}",
        fixture.driver.paths()
    );
}
