//! The LBA shard store.
//!
//! Maps `block index -> content hash` for one vdisk, persisted as
//! fixed-size shards in the meta hash key `meta:<vdiskID>` (one field per
//! shard index, routed by shard index). Shards load lazily on first
//! access and stay resident in an LRU cache bounded by a byte budget;
//! eviction never drops a dirty shard without flushing it first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::Mutex;

use blockio_ardb::{decode, op, Action, Cluster, Command, IndexActionPair};
use blockio_common::{BlockHash, Error, Result, VdiskId};

use crate::shard::{Shard, BYTES_PER_SHARD, RECORDS_PER_SHARD};

/// Default byte budget for resident shards (20 MiB)
pub const DEFAULT_CACHE_LIMIT: usize = 20 * 1024 * 1024;

/// The meta key holding a vdisk's LBA shards
#[must_use]
pub fn meta_key(vdisk_id: &VdiskId) -> String {
    format!("meta:{vdisk_id}")
}

struct ShardCache {
    shards: HashMap<u64, Shard>,
    /// LRU order, most recently used at the back
    order: VecDeque<u64>,
    /// Bound on resident shards
    capacity: usize,
}

impl ShardCache {
    fn touch(&mut self, shard_index: u64) {
        self.order.retain(|&i| i != shard_index);
        self.order.push_back(shard_index);
    }
}

/// The LBA index of one vdisk
pub struct Lba {
    key: String,
    cluster: Arc<Cluster>,
    cache: Mutex<ShardCache>,
}

impl Lba {
    /// Create an LBA store with the default cache budget.
    #[must_use]
    pub fn new(vdisk_id: &VdiskId, cluster: Arc<Cluster>) -> Self {
        Self::with_cache_limit(vdisk_id, cluster, DEFAULT_CACHE_LIMIT)
    }

    /// Create an LBA store bounding resident shards to
    /// `cache_limit_bytes`. Budgets below one shard round up to one.
    #[must_use]
    pub fn with_cache_limit(
        vdisk_id: &VdiskId,
        cluster: Arc<Cluster>,
        cache_limit_bytes: usize,
    ) -> Self {
        let capacity = (cache_limit_bytes / BYTES_PER_SHARD).max(1);
        Self {
            key: meta_key(vdisk_id),
            cluster,
            cache: Mutex::new(ShardCache {
                shards: HashMap::new(),
                order: VecDeque::new(),
                capacity,
            }),
        }
    }

    /// Hash recorded for a block index; the nil hash when absent.
    pub async fn get(&self, block_index: u64) -> Result<BlockHash> {
        let (shard_index, slot) = split_index(block_index);
        let mut cache = self.cache.lock().await;
        let shard = self.resident_shard(&mut cache, shard_index).await?;
        Ok(shard.get(slot))
    }

    /// Record a hash for a block index, marking its shard dirty.
    pub async fn set(&self, block_index: u64, hash: BlockHash) -> Result<()> {
        let (shard_index, slot) = split_index(block_index);
        let mut cache = self.cache.lock().await;
        let shard = self.resident_shard(&mut cache, shard_index).await?;
        shard.set(slot, hash);
        Ok(())
    }

    /// Remove the record for a block index.
    pub async fn delete(&self, block_index: u64) -> Result<()> {
        self.set(block_index, BlockHash::NIL).await
    }

    /// Write every dirty shard: one put per shard, fanned out as a single
    /// batched dispatch over the meta cluster. A shard left all-nil by
    /// its pending sets is deleted instead of written. Dirty flags clear
    /// only after the batch succeeds.
    pub async fn flush(&self) -> Result<()> {
        let mut cache = self.cache.lock().await;

        let mut pairs = Vec::new();
        let mut flushed = Vec::new();
        for (&shard_index, shard) in &cache.shards {
            if !shard.is_dirty() {
                continue;
            }
            pairs.push(IndexActionPair::new(
                shard_index,
                self.write_action(shard_index, shard)?,
            ));
            flushed.push(shard_index);
        }
        if pairs.is_empty() {
            return Ok(());
        }

        self.cluster.apply_for_all(pairs).await?;

        for shard_index in flushed {
            if let Some(shard) = cache.shards.get_mut(&shard_index) {
                shard.unset_dirty();
            }
        }
        Ok(())
    }

    /// Resident shard count, for eviction tests.
    pub async fn resident_shards(&self) -> usize {
        self.cache.lock().await.shards.len()
    }

    async fn resident_shard<'a>(
        &self,
        cache: &'a mut ShardCache,
        shard_index: u64,
    ) -> Result<&'a mut Shard> {
        if cache.shards.contains_key(&shard_index) {
            cache.touch(shard_index);
        } else {
            let shard = self.load_shard(shard_index).await?;
            cache.shards.insert(shard_index, shard);
            cache.order.push_back(shard_index);
            self.evict_excess(cache).await?;
        }
        Ok(cache
            .shards
            .get_mut(&shard_index)
            .expect("shard resident after insert"))
    }

    async fn load_shard(&self, shard_index: u64) -> Result<Shard> {
        let reply = self
            .cluster
            .apply_for(
                shard_index,
                Command::new(op::HGET)
                    .arg(self.key.as_str())
                    .arg(shard_index)
                    .into(),
            )
            .await?;
        match decode::opt_bytes(reply)? {
            Some(bytes) => Shard::from_bytes(&bytes),
            None => Ok(Shard::new()),
        }
    }

    /// Drop least-recently-used shards down to capacity, flushing dirty
    /// victims first. The most recent entry is never the victim.
    async fn evict_excess(&self, cache: &mut ShardCache) -> Result<()> {
        while cache.shards.len() > cache.capacity {
            let Some(&victim) = cache.order.front() else {
                break;
            };
            if let Some(shard) = cache.shards.get(&victim) {
                if shard.is_dirty() {
                    let action = self.write_action(victim, shard)?;
                    self.cluster.apply_for(victim, action).await?;
                }
            }
            cache.order.pop_front();
            cache.shards.remove(&victim);
            tracing::trace!(shard = victim, "evicted LBA shard");
        }
        Ok(())
    }

    fn write_action(&self, shard_index: u64, shard: &Shard) -> Result<Action> {
        match shard.serialize() {
            Ok(bytes) => Ok(Command::new(op::HSET)
                .arg(self.key.as_str())
                .arg(shard_index)
                .arg(bytes)
                .into()),
            Err(Error::NilShardWrite) => Ok(Command::new(op::HDEL)
                .arg(self.key.as_str())
                .arg(shard_index)
                .into()),
            Err(err) => Err(err),
        }
    }
}

fn split_index(block_index: u64) -> (u64, usize) {
    (
        block_index / RECORDS_PER_SHARD as u64,
        (block_index % RECORDS_PER_SHARD as u64) as usize,
    )
}
