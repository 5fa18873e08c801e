//! Backup configuration and source-side resolution.

use std::sync::Arc;

use blockio_ardb::Cluster;
use blockio_common::{BlockSize, Source, VdiskId, VdiskStaticConfig};
use blockio_storage::{BlockStorage, BlockStorageConfig};

use crate::compress::CompressionType;
use crate::crypto::CryptoKey;
use crate::error::Result;

/// Default snapshot block size (128 KiB)
pub const DEFAULT_BLOCK_SIZE: u32 = 128 * 1024;

/// Configuration of one export or import run.
///
/// Compression type and crypto key must match between the export and
/// import of a snapshot.
#[derive(Clone)]
pub struct BackupConfig {
    /// Vdisk to export from or import into
    pub vdisk_id: VdiskId,
    /// Snapshot identifier; the vdisk identifier when unset
    pub snapshot_id: Option<String>,
    /// Snapshot block size; 128 KiB when unset
    pub block_size: Option<BlockSize>,
    /// Parallel workers; the logical CPU count when zero
    pub job_count: usize,
    pub compression: CompressionType,
    pub crypto_key: CryptoKey,
    /// Export only: start from a fresh deduped map when the existing one
    /// cannot be loaded (wrong key/compression, corrupt data).
    pub force: bool,
}

impl BackupConfig {
    #[must_use]
    pub fn new(vdisk_id: VdiskId, crypto_key: CryptoKey) -> Self {
        Self {
            vdisk_id,
            snapshot_id: None,
            block_size: None,
            job_count: 0,
            compression: CompressionType::default(),
            crypto_key,
            force: false,
        }
    }

    pub(crate) fn snapshot_id(&self) -> String {
        self.snapshot_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.vdisk_id.to_string())
    }

    pub(crate) fn snapshot_block_size(&self) -> Result<BlockSize> {
        match self.block_size {
            Some(block_size) => Ok(block_size),
            None => Ok(BlockSize::new(DEFAULT_BLOCK_SIZE)?),
        }
    }

    pub(crate) fn jobs(&self) -> usize {
        if self.job_count > 0 {
            return self.job_count;
        }
        std::thread::available_parallelism().map_or(1, |n| n.get())
    }
}

/// The source-side stack a backup run operates on
pub(crate) struct SourceStorage {
    pub static_cfg: VdiskStaticConfig,
    pub cluster: Arc<Cluster>,
    pub storage: Arc<BlockStorage>,
}

/// Resolve a vdisk's cluster configuration and open its block storage.
pub(crate) fn open_source_storage(
    source: &dyn Source,
    vdisk_id: &VdiskId,
) -> Result<SourceStorage> {
    let static_cfg = source.read_vdisk_static_config(vdisk_id)?;
    let nbd_cfg = source.read_vdisk_nbd_config(vdisk_id)?;

    let cluster_cfg = source.read_storage_cluster_config(&nbd_cfg.storage_cluster_id)?;
    let cluster = Arc::new(Cluster::fixed(cluster_cfg, None)?);

    let template = match nbd_cfg.template_cluster_id.as_deref() {
        Some(id) if !id.is_empty() => {
            let template_cfg = source.read_storage_cluster_config(id)?;
            Some(Arc::new(Cluster::fixed(template_cfg, None)?))
        }
        _ => None,
    };

    let storage = Arc::new(BlockStorage::new(
        BlockStorageConfig::new(
            vdisk_id.clone(),
            static_cfg.vdisk_type,
            static_cfg.block_size,
        ),
        cluster.clone(),
        template,
    ));

    Ok(SourceStorage {
        static_cfg,
        cluster,
        storage,
    })
}
