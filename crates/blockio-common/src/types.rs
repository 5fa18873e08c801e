//! Core type definitions for the blockio data plane.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::Error;

/// Width in bytes of a block content hash
pub const HASH_SIZE: usize = 32;

/// Content hash of a block.
///
/// The all-zero hash is the nil hash and is reserved to mean "no block";
/// it is never persisted.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockHash([u8; HASH_SIZE]);

impl BlockHash {
    /// The reserved "no block" sentinel
    pub const NIL: Self = Self([0u8; HASH_SIZE]);

    /// Hash the given block contents
    #[must_use]
    pub fn of(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Create from a raw 32-byte digest
    #[must_use]
    pub const fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from a byte slice, `None` if the length is wrong
    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != HASH_SIZE {
            return None;
        }
        let mut arr = [0u8; HASH_SIZE];
        arr.copy_from_slice(bytes);
        Some(Self(arr))
    }

    /// Raw digest bytes
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }

    /// Whether this is the nil hash
    #[must_use]
    pub fn is_nil(&self) -> bool {
        self.0 == [0u8; HASH_SIZE]
    }

    /// Lowercase hex encoding of the digest
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Deterministic object index derived from the digest,
    /// used to route content-addressed blocks across a cluster.
    #[must_use]
    pub fn routing_index(&self) -> u64 {
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(prefix)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identifier of a virtual disk
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VdiskId(String);

impl VdiskId {
    /// Create a new vdisk identifier
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the identifier is empty or contains
    /// whitespace (it is embedded verbatim in storage keys).
    pub fn new(id: impl Into<String>) -> Result<Self, Error> {
        let id = id.into();
        if id.is_empty() {
            return Err(Error::invalid_input("vdisk identifier is empty"));
        }
        if id.chars().any(char::is_whitespace) {
            return Err(Error::invalid_input(format!(
                "vdisk identifier {id:?} contains whitespace"
            )));
        }
        Ok(Self(id))
    }

    /// Get the identifier as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for VdiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VdiskId({:?})", self.0)
    }
}

impl fmt::Display for VdiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Size in bytes of a vdisk block: a power of two in `[512, 2^24]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub struct BlockSize(u32);

impl BlockSize {
    /// Smallest supported block size
    pub const MIN: u32 = 512;
    /// Largest supported block size
    pub const MAX: u32 = 1 << 24;

    /// Create a validated block size
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` when the size is not a power of two within
    /// `[MIN, MAX]`.
    pub fn new(size: u32) -> Result<Self, Error> {
        if !size.is_power_of_two() || size < Self::MIN || size > Self::MAX {
            return Err(Error::invalid_input(format!(
                "block size {size} is not a power of two in [{}, {}]",
                Self::MIN,
                Self::MAX
            )));
        }
        Ok(Self(size))
    }

    /// The size in bytes
    #[must_use]
    pub const fn bytes(self) -> u32 {
        self.0
    }

    /// The size in bytes, widened for arithmetic on offsets
    #[must_use]
    pub const fn bytes_u64(self) -> u64 {
        self.0 as u64
    }
}

impl TryFrom<u32> for BlockSize {
    type Error = Error;

    fn try_from(size: u32) -> Result<Self, Error> {
        Self::new(size)
    }
}

impl From<BlockSize> for u32 {
    fn from(size: BlockSize) -> u32 {
        size.0
    }
}

/// The storage flavor of a vdisk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VdiskType {
    /// Content-addressed block storage behind an LBA index
    Deduped,
    /// One block per hash field, no content addressing
    NonDeduped,
    /// Deduped storage meant to be cloned from
    Template,
    /// Volatile non-deduped storage
    Cache,
}

impl VdiskType {
    /// Whether vdisks of this type store blocks content-addressed
    #[must_use]
    pub const fn is_deduped(self) -> bool {
        matches!(self, Self::Deduped | Self::Template)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_hash() {
        assert!(BlockHash::NIL.is_nil());
        assert!(!BlockHash::of(b"content").is_nil());
    }

    #[test]
    fn test_hash_of_is_stable() {
        let a = BlockHash::of(b"some block");
        let b = BlockHash::of(b"some block");
        assert_eq!(a, b);
        assert_eq!(a.routing_index(), b.routing_index());
        assert_ne!(a, BlockHash::of(b"another block"));
    }

    #[test]
    fn test_hash_from_slice() {
        let digest = BlockHash::of(b"x");
        assert_eq!(BlockHash::from_slice(digest.as_bytes()), Some(digest));
        assert_eq!(BlockHash::from_slice(&[0u8; 16]), None);
    }

    #[test]
    fn test_vdisk_id_validation() {
        assert!(VdiskId::new("vd1").is_ok());
        assert!(VdiskId::new("").is_err());
        assert!(VdiskId::new("a b").is_err());
    }

    #[test]
    fn test_block_size_validation() {
        assert!(BlockSize::new(512).is_ok());
        assert!(BlockSize::new(4096).is_ok());
        assert!(BlockSize::new(1 << 24).is_ok());
        assert!(BlockSize::new(0).is_err());
        assert!(BlockSize::new(256).is_err());
        assert!(BlockSize::new(4097).is_err());
        assert!(BlockSize::new(1 << 25).is_err());
    }

    #[test]
    fn test_vdisk_type_dedup_flavor() {
        assert!(VdiskType::Deduped.is_deduped());
        assert!(VdiskType::Template.is_deduped());
        assert!(!VdiskType::NonDeduped.is_deduped());
        assert!(!VdiskType::Cache.is_deduped());
    }
}
