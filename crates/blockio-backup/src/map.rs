//! The deduped map of a snapshot.
//!
//! Maps `block index -> content hash` for every non-nil block of a
//! snapshot. Stored as a versioned binary envelope, compressed and
//! encrypted with the same settings as the blocks it references. Entries
//! serialize in ascending index order and the envelope carries no
//! timestamp, so identical content serializes identically.

use std::collections::{BTreeMap, HashSet};

use parking_lot::Mutex;

use blockio_common::{BlockHash, BlockSize, HASH_SIZE};

use crate::compress::CompressionType;
use crate::crypto::Crypter;
use crate::error::{BackupError, Result};

/// Envelope magic, `"dedupmap"` as little-endian bytes
pub const MAP_MAGIC: u64 = u64::from_le_bytes(*b"dedupmap");

/// Envelope format version
pub const MAP_VERSION: u32 = 1;

const HEADER_SIZE: usize = 8 + 4 + 4 + 8;
const ENTRY_SIZE: usize = 8 + HASH_SIZE;

/// The index-to-hash map of one snapshot.
///
/// Thread-safe: export workers record entries concurrently.
pub struct DedupedMap {
    block_size: BlockSize,
    entries: Mutex<BTreeMap<u64, BlockHash>>,
}

impl DedupedMap {
    /// An empty map for a snapshot with the given block size.
    #[must_use]
    pub fn new(block_size: BlockSize) -> Self {
        Self {
            block_size,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// The snapshot's block size
    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Record `index -> hash`. A nil hash removes the entry instead.
    pub fn set(&self, index: u64, hash: BlockHash) {
        let mut entries = self.entries.lock();
        if hash.is_nil() {
            entries.remove(&index);
        } else {
            entries.insert(index, hash);
        }
    }

    /// Hash recorded for an index
    #[must_use]
    pub fn get(&self, index: u64) -> Option<BlockHash> {
        self.entries.lock().get(&index).copied()
    }

    /// Number of recorded entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// All entries in ascending index order
    #[must_use]
    pub fn entries(&self) -> Vec<(u64, BlockHash)> {
        self.entries
            .lock()
            .iter()
            .map(|(&index, &hash)| (index, hash))
            .collect()
    }

    /// The distinct hashes the map references
    #[must_use]
    pub fn known_hashes(&self) -> HashSet<BlockHash> {
        self.entries.lock().values().copied().collect()
    }

    /// Serialize, compress and seal the map.
    pub fn serialize(&self, compression: CompressionType, crypter: &Crypter) -> Result<Vec<u8>> {
        let entries = self.entries.lock();

        let mut raw = Vec::with_capacity(HEADER_SIZE + entries.len() * ENTRY_SIZE);
        raw.extend_from_slice(&MAP_MAGIC.to_le_bytes());
        raw.extend_from_slice(&MAP_VERSION.to_le_bytes());
        raw.extend_from_slice(&self.block_size.bytes().to_le_bytes());
        raw.extend_from_slice(&(entries.len() as u64).to_le_bytes());
        for (&index, &hash) in entries.iter() {
            raw.extend_from_slice(&index.to_le_bytes());
            raw.extend_from_slice(hash.as_bytes());
        }
        drop(entries);

        let compressed = compression.compress(&raw)?;
        crypter.encrypt(&compressed)
    }

    /// Open, decompress and parse a map produced by
    /// [`DedupedMap::serialize`] with the same settings.
    ///
    /// # Errors
    ///
    /// `Decrypt`/`Decompress` when the settings or key do not match;
    /// `CorruptMap` when the envelope does not parse.
    pub fn deserialize(
        data: &[u8],
        compression: CompressionType,
        crypter: &Crypter,
    ) -> Result<Self> {
        let compressed = crypter.decrypt(data)?;
        let raw = compression.decompress(&compressed)?;

        if raw.len() < HEADER_SIZE {
            return Err(BackupError::corrupt_map(format!(
                "envelope of {} bytes is shorter than the header",
                raw.len()
            )));
        }

        let magic = u64::from_le_bytes(raw[0..8].try_into().expect("fixed-width header field"));
        if magic != MAP_MAGIC {
            return Err(BackupError::corrupt_map("bad magic"));
        }
        let version =
            u32::from_le_bytes(raw[8..12].try_into().expect("fixed-width header field"));
        if version != MAP_VERSION {
            return Err(BackupError::corrupt_map(format!(
                "unsupported version {version}"
            )));
        }
        let block_size =
            u32::from_le_bytes(raw[12..16].try_into().expect("fixed-width header field"));
        let block_size = BlockSize::new(block_size)
            .map_err(|err| BackupError::corrupt_map(err.to_string()))?;
        let entry_count =
            u64::from_le_bytes(raw[16..24].try_into().expect("fixed-width header field"))
                as usize;

        let body = &raw[HEADER_SIZE..];
        if body.len() != entry_count * ENTRY_SIZE {
            return Err(BackupError::corrupt_map(format!(
                "expected {entry_count} entries, found {} bytes of entry data",
                body.len()
            )));
        }

        let mut entries = BTreeMap::new();
        for entry in body.chunks_exact(ENTRY_SIZE) {
            let index = u64::from_le_bytes(entry[..8].try_into().expect("fixed-width entry field"));
            let hash = BlockHash::from_slice(&entry[8..]).ok_or_else(|| {
                BackupError::corrupt_map("entry hash has the wrong width")
            })?;
            if hash.is_nil() {
                return Err(BackupError::corrupt_map(format!(
                    "entry for index {index} holds the nil hash"
                )));
            }
            entries.insert(index, hash);
        }

        Ok(Self {
            block_size,
            entries: Mutex::new(entries),
        })
    }
}
