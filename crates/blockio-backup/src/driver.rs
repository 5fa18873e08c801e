//! Backup store drivers.
//!
//! A driver reads and writes the objects of a snapshot: content-addressed
//! blocks under a two-level path derived from their hash, and the deduped
//! map under `<snapshot>/map`. Drivers move opaque sealed bytes;
//! compression and crypto happen in the pipeline.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use parking_lot::Mutex;

use blockio_common::BlockHash;

use crate::error::Result;

/// Relative path of a block object within the store
#[must_use]
pub fn block_path(snapshot_id: &str, hash: &BlockHash) -> String {
    let hex = hash.to_hex();
    format!("{snapshot_id}/{}/{}/{}", &hex[..2], &hex[2..4], &hex[4..])
}

/// Relative path of a snapshot's deduped map
#[must_use]
pub fn map_path(snapshot_id: &str) -> String {
    format!("{snapshot_id}/map")
}

/// Reads and writes the sealed objects of snapshots
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Store a sealed block. Blocks are content-addressed and immutable:
    /// an already-present object is left untouched.
    async fn set_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
        data: &[u8],
    ) -> Result<()>;

    /// Fetch a sealed block; `None` when the store holds no such object.
    async fn get_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
    ) -> Result<Option<Vec<u8>>>;

    /// Store (or replace) a snapshot's sealed deduped map.
    async fn set_deduped_map(&self, snapshot_id: &str, data: &[u8]) -> Result<()>;

    /// Fetch a snapshot's sealed deduped map; `None` when the snapshot
    /// does not exist.
    async fn get_deduped_map(&self, snapshot_id: &str) -> Result<Option<Vec<u8>>>;
}

/// A backup store on the local filesystem
pub struct LocalDriver {
    root: PathBuf,
}

impl LocalDriver {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    async fn write_object(&self, relative: String, data: &[u8]) -> Result<()> {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn read_object(&self, relative: String) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.root.join(relative)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[async_trait]
impl StorageDriver for LocalDriver {
    async fn set_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
        data: &[u8],
    ) -> Result<()> {
        let relative = block_path(snapshot_id, &hash);
        if tokio::fs::try_exists(self.root.join(&relative)).await? {
            return Ok(());
        }
        self.write_object(relative, data).await
    }

    async fn get_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
    ) -> Result<Option<Vec<u8>>> {
        self.read_object(block_path(snapshot_id, &hash)).await
    }

    async fn set_deduped_map(&self, snapshot_id: &str, data: &[u8]) -> Result<()> {
        self.write_object(map_path(snapshot_id), data).await
    }

    async fn get_deduped_map(&self, snapshot_id: &str) -> Result<Option<Vec<u8>>> {
        self.read_object(map_path(snapshot_id)).await
    }
}

/// An in-memory backup store, for tests and embedding
#[derive(Default)]
pub struct MemoryDriver {
    objects: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryDriver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored object at a path, if any.
    #[must_use]
    pub fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().get(path).cloned()
    }

    /// Every stored path, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.objects.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Number of stored objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    /// Overwrite the object at a path, bypassing the lazy-store rule.
    /// Tests use this to corrupt stored objects.
    pub fn insert_object(&self, path: impl Into<String>, data: Vec<u8>) {
        self.objects.lock().insert(path.into(), data);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }
}

#[async_trait]
impl StorageDriver for MemoryDriver {
    async fn set_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
        data: &[u8],
    ) -> Result<()> {
        self.objects
            .lock()
            .entry(block_path(snapshot_id, &hash))
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn get_deduped_block(
        &self,
        snapshot_id: &str,
        hash: BlockHash,
    ) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(&block_path(snapshot_id, &hash)).cloned())
    }

    async fn set_deduped_map(&self, snapshot_id: &str, data: &[u8]) -> Result<()> {
        self.objects.lock().insert(map_path(snapshot_id), data.to_vec());
        Ok(())
    }

    async fn get_deduped_map(&self, snapshot_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().get(&map_path(snapshot_id)).cloned())
    }
}
