//! blockio storage - vdisk block storage over an ARDB cluster
//!
//! Two storage flavors, selected by vdisk type:
//! - non-deduped: one hash key per vdisk, one field per block index
//! - deduped: content-addressed blocks keyed by their hash, with the LBA
//!   index mapping block indices to hashes
//!
//! An all-zero block is the nil block and is never persisted: writing one
//! deletes whatever the index held.

pub mod deduped;
pub mod nondeduped;

use std::sync::Arc;

use bytes::Bytes;

use blockio_ardb::{decode, Cluster, StorageServer};
use blockio_common::{BlockSize, Error, Result, VdiskId, VdiskType};
use blockio_lba::{meta_key, Shard, RECORDS_PER_SHARD};

pub use deduped::DedupedStorage;
pub use nondeduped::NonDedupedStorage;

/// What a block storage needs to know about its vdisk
#[derive(Clone, Debug)]
pub struct BlockStorageConfig {
    pub vdisk_id: VdiskId,
    pub vdisk_type: VdiskType,
    pub block_size: BlockSize,
    /// Byte budget for the LBA shard cache (deduped flavors only)
    pub lba_cache_limit: usize,
}

impl BlockStorageConfig {
    #[must_use]
    pub fn new(vdisk_id: VdiskId, vdisk_type: VdiskType, block_size: BlockSize) -> Self {
        Self {
            vdisk_id,
            vdisk_type,
            block_size,
            lba_cache_limit: blockio_lba::DEFAULT_CACHE_LIMIT,
        }
    }
}

/// Block storage for one vdisk
pub enum BlockStorage {
    Deduped(DedupedStorage),
    NonDeduped(NonDedupedStorage),
}

impl BlockStorage {
    /// Create the storage flavor matching the vdisk type.
    ///
    /// `template` is the optional template cluster consulted when a
    /// deduped read misses on the primary; non-deduped flavors ignore it.
    #[must_use]
    pub fn new(
        cfg: BlockStorageConfig,
        cluster: Arc<Cluster>,
        template: Option<Arc<Cluster>>,
    ) -> Self {
        if cfg.vdisk_type.is_deduped() {
            Self::Deduped(DedupedStorage::new(cfg, cluster, template))
        } else {
            Self::NonDeduped(NonDedupedStorage::new(cfg, cluster))
        }
    }

    /// Read the block at an index; `None` when the index holds no block.
    pub async fn get_block(&self, index: u64) -> Result<Option<Bytes>> {
        match self {
            Self::Deduped(storage) => storage.get_block(index).await,
            Self::NonDeduped(storage) => storage.get_block(index).await,
        }
    }

    /// Write the block at an index. An all-zero block deletes the index.
    pub async fn set_block(&self, index: u64, block: &[u8]) -> Result<()> {
        match self {
            Self::Deduped(storage) => storage.set_block(index, block).await,
            Self::NonDeduped(storage) => storage.set_block(index, block).await,
        }
    }

    /// Delete the block at an index.
    pub async fn delete_block(&self, index: u64) -> Result<()> {
        match self {
            Self::Deduped(storage) => storage.delete_block(index).await,
            Self::NonDeduped(storage) => storage.delete_block(index).await,
        }
    }

    /// Persist any buffered index state.
    pub async fn flush(&self) -> Result<()> {
        match self {
            Self::Deduped(storage) => storage.flush().await,
            Self::NonDeduped(_) => Ok(()),
        }
    }

    /// The vdisk's block size
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        match self {
            Self::Deduped(storage) => storage.block_size(),
            Self::NonDeduped(storage) => storage.block_size(),
        }
    }
}

/// Whether a block contains only zero bytes
#[must_use]
pub fn is_nil_block(block: &[u8]) -> bool {
    block.iter().all(|&b| b == 0)
}

/// Enumerate every block index stored for a vdisk, sorted ascending.
///
/// Non-deduped vdisks are enumerated by broadcasting a field listing to
/// every operational server; deduped vdisks by scanning the LBA shards.
pub async fn list_block_indices(
    vdisk_id: &VdiskId,
    vdisk_type: VdiskType,
    cluster: &Cluster,
) -> Result<Vec<u64>> {
    let mut indices = if vdisk_type.is_deduped() {
        list_deduped_block_indices(vdisk_id, cluster).await?
    } else {
        list_hash_fields(cluster.servers()?, nondeduped::storage_key(vdisk_id)).await?
    };
    indices.sort_unstable();
    indices.dedup();
    Ok(indices)
}

async fn list_deduped_block_indices(vdisk_id: &VdiskId, cluster: &Cluster) -> Result<Vec<u64>> {
    let shard_indices = list_hash_fields(cluster.servers()?, meta_key(vdisk_id)).await?;
    if shard_indices.is_empty() {
        return Ok(Vec::new());
    }

    let key = meta_key(vdisk_id);
    let pairs = shard_indices
        .iter()
        .map(|&shard_index| {
            blockio_ardb::IndexActionPair::new(
                shard_index,
                blockio_ardb::Command::new(blockio_ardb::op::HGET)
                    .arg(key.as_str())
                    .arg(shard_index),
            )
        })
        .collect();
    let replies = cluster.apply_for_all(pairs).await?;

    let mut indices = Vec::new();
    for (shard_index, reply) in shard_indices.into_iter().zip(replies) {
        let Some(bytes) = decode::opt_bytes(reply)? else {
            continue;
        };
        let shard = Shard::from_bytes(&bytes)?;
        for slot in 0..RECORDS_PER_SHARD {
            if !shard.get(slot).is_nil() {
                indices.push(shard_index * RECORDS_PER_SHARD as u64 + slot as u64);
            }
        }
    }
    Ok(indices)
}

/// Broadcast a field listing of `key` to every given server and parse the
/// fields as decimal indices.
async fn list_hash_fields(servers: Vec<StorageServer>, key: String) -> Result<Vec<u64>> {
    let mut indices = Vec::new();
    for server in servers {
        let reply = server
            .apply(
                &blockio_ardb::Command::new(blockio_ardb::op::HKEYS)
                    .arg(key.as_str())
                    .into(),
            )
            .await?;
        for field in decode::values(reply)? {
            let field = decode::bytes(field)?;
            let index = std::str::from_utf8(&field)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| {
                    Error::protocol(format!(
                        "stored field {:?} is not a block index",
                        String::from_utf8_lossy(&field)
                    ))
                })?;
            indices.push(index);
        }
    }
    Ok(indices)
}
