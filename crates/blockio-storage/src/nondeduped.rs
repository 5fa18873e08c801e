//! Non-deduped block storage.
//!
//! Blocks live in one hash per vdisk, `nondedup:<vdiskID>`, field =
//! decimal block index, routed by block index. No content addressing.

use std::sync::Arc;

use bytes::Bytes;

use blockio_ardb::{decode, op, Cluster, Command};
use blockio_common::{BlockSize, Result, VdiskId};

use crate::{is_nil_block, BlockStorageConfig};

/// The hash key holding a vdisk's non-deduped blocks
#[must_use]
pub fn storage_key(vdisk_id: &VdiskId) -> String {
    format!("nondedup:{vdisk_id}")
}

/// Non-deduped block storage for one vdisk
pub struct NonDedupedStorage {
    key: String,
    block_size: BlockSize,
    cluster: Arc<Cluster>,
}

impl NonDedupedStorage {
    #[must_use]
    pub fn new(cfg: BlockStorageConfig, cluster: Arc<Cluster>) -> Self {
        Self {
            key: storage_key(&cfg.vdisk_id),
            block_size: cfg.block_size,
            cluster,
        }
    }

    pub async fn get_block(&self, index: u64) -> Result<Option<Bytes>> {
        let reply = self
            .cluster
            .apply_for(
                index,
                Command::new(op::HGET)
                    .arg(self.key.as_str())
                    .arg(index)
                    .into(),
            )
            .await?;
        decode::opt_bytes(reply)
    }

    pub async fn set_block(&self, index: u64, block: &[u8]) -> Result<()> {
        if is_nil_block(block) {
            return self.delete_block(index).await;
        }
        self.cluster
            .apply_for(
                index,
                Command::new(op::HSET)
                    .arg(self.key.as_str())
                    .arg(index)
                    .arg(block)
                    .into(),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_block(&self, index: u64) -> Result<()> {
        self.cluster
            .apply_for(
                index,
                Command::new(op::HDEL)
                    .arg(self.key.as_str())
                    .arg(index)
                    .into(),
            )
            .await?;
        Ok(())
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }
}
