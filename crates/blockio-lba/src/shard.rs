//! Fixed-size shards of the LBA index.

use bytes::Bytes;

use blockio_common::{BlockHash, Error, Result, HASH_SIZE};

/// Number of hash slots per shard
pub const RECORDS_PER_SHARD: usize = 128;

/// Serialized size of one shard
pub const BYTES_PER_SHARD: usize = RECORDS_PER_SHARD * HASH_SIZE;

/// One 128-slot record of the LBA index.
///
/// A slot holding the nil hash means "no block". A shard whose slots are
/// all nil is itself nil: it cannot be serialized and its stored record
/// is deleted instead.
pub struct Shard {
    hashes: Box<[BlockHash; RECORDS_PER_SHARD]>,
    dirty: bool,
}

impl Shard {
    /// A fresh shard with every slot nil. Not dirty.
    #[must_use]
    pub fn new() -> Self {
        Self {
            hashes: Box::new([BlockHash::NIL; RECORDS_PER_SHARD]),
            dirty: false,
        }
    }

    /// Deserialize a shard from its stored form: 128 concatenated
    /// fixed-width hashes. A freshly deserialized shard is not dirty.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when the buffer is shorter than [`BYTES_PER_SHARD`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BYTES_PER_SHARD {
            return Err(Error::invalid_input(format!(
                "raw shard of {} bytes is too small, expected {BYTES_PER_SHARD}",
                bytes.len()
            )));
        }
        let mut shard = Self::new();
        for slot in 0..RECORDS_PER_SHARD {
            let offset = slot * HASH_SIZE;
            let mut digest = [0u8; HASH_SIZE];
            digest.copy_from_slice(&bytes[offset..offset + HASH_SIZE]);
            shard.hashes[slot] = BlockHash::from_bytes(digest);
        }
        Ok(shard)
    }

    /// Hash stored in the given slot
    #[must_use]
    pub fn get(&self, slot: usize) -> BlockHash {
        self.hashes[slot]
    }

    /// Store a hash in the given slot, marking the shard dirty.
    pub fn set(&mut self, slot: usize, hash: BlockHash) {
        self.hashes[slot] = hash;
        self.dirty = true;
    }

    /// Whether this shard has unflushed mutations
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag after a successful write.
    pub fn unset_dirty(&mut self) {
        self.dirty = false;
    }

    /// Whether every slot is nil
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.hashes.iter().all(BlockHash::is_nil)
    }

    /// Serialize to the stored form.
    ///
    /// # Errors
    ///
    /// `NilShardWrite` when every slot is nil; the store turns this into
    /// a delete of the shard record.
    pub fn serialize(&self) -> Result<Bytes> {
        if self.is_nil() {
            return Err(Error::NilShardWrite);
        }
        let mut buf = Vec::with_capacity(BYTES_PER_SHARD);
        for hash in self.hashes.iter() {
            buf.extend_from_slice(hash.as_bytes());
        }
        Ok(Bytes::from(buf))
    }
}

impl Default for Shard {
    fn default() -> Self {
        Self::new()
    }
}
