//! Deduped block storage.
//!
//! Block content lives under its 32-byte hash as key, routed by the
//! hash's first eight little-endian bytes; the LBA index maps block
//! indices to hashes. Identical blocks are stored once.
//!
//! When a read misses on the primary cluster and a template cluster is
//! configured, the template is consulted and a hit repairs the primary
//! copy in passing.

use std::sync::Arc;

use bytes::Bytes;

use blockio_ardb::{decode, op, Cluster, Command};
use blockio_common::{BlockHash, BlockSize, Result};
use blockio_lba::Lba;

use crate::{is_nil_block, BlockStorageConfig};

/// Deduped block storage for one vdisk
pub struct DedupedStorage {
    block_size: BlockSize,
    cluster: Arc<Cluster>,
    template: Option<Arc<Cluster>>,
    lba: Lba,
}

impl DedupedStorage {
    #[must_use]
    pub fn new(
        cfg: BlockStorageConfig,
        cluster: Arc<Cluster>,
        template: Option<Arc<Cluster>>,
    ) -> Self {
        let lba = Lba::with_cache_limit(&cfg.vdisk_id, cluster.clone(), cfg.lba_cache_limit);
        Self {
            block_size: cfg.block_size,
            cluster,
            template,
            lba,
        }
    }

    pub async fn get_block(&self, index: u64) -> Result<Option<Bytes>> {
        let hash = self.lba.get(index).await?;
        if hash.is_nil() {
            return Ok(None);
        }

        let reply = self
            .cluster
            .apply_for(hash.routing_index(), fetch_content(&hash))
            .await?;
        if let Some(content) = decode::opt_bytes(reply)? {
            return Ok(Some(content));
        }

        self.fetch_from_template(&hash).await
    }

    /// Consult the template cluster for missing content and repair the
    /// primary copy on a hit.
    async fn fetch_from_template(&self, hash: &BlockHash) -> Result<Option<Bytes>> {
        let Some(template) = &self.template else {
            tracing::warn!(hash = %hash, "hash recorded without content, treating as absent");
            return Ok(None);
        };

        let reply = template
            .apply_for(hash.routing_index(), fetch_content(hash))
            .await?;
        let Some(content) = decode::opt_bytes(reply)? else {
            tracing::warn!(hash = %hash, "hash recorded without content on primary or template");
            return Ok(None);
        };

        if let Err(err) = self
            .cluster
            .apply_for(hash.routing_index(), store_content(hash, &content))
            .await
        {
            tracing::warn!(hash = %hash, error = %err, "failed to repair primary copy from template");
        }
        Ok(Some(content))
    }

    pub async fn set_block(&self, index: u64, block: &[u8]) -> Result<()> {
        if is_nil_block(block) {
            // the content may be shared; only the mapping goes
            return self.lba.delete(index).await;
        }

        let hash = BlockHash::of(block);
        self.cluster
            .apply_for(hash.routing_index(), store_content(&hash, block))
            .await?;
        self.lba.set(index, hash).await
    }

    pub async fn delete_block(&self, index: u64) -> Result<()> {
        self.lba.delete(index).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.lba.flush().await
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

fn fetch_content(hash: &BlockHash) -> blockio_ardb::Action {
    Command::new(op::GET).arg(hash).into()
}

fn store_content(hash: &BlockHash, content: &[u8]) -> blockio_ardb::Action {
    Command::new(op::SET).arg(hash).arg(content).into()
}
