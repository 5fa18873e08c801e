//! Backup pipeline errors.

use thiserror::Error;

use blockio_common::BlockHash;

/// Result type for backup operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Errors raised by the snapshot export/import pipeline
#[derive(Debug, Error)]
pub enum BackupError {
    #[error(transparent)]
    Core(#[from] blockio_common::Error),

    #[error("compression failed: {0}")]
    Compress(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("decryption failed: {0}")]
    Decrypt(String),

    #[error("invalid crypto key: expected {expected} bytes, got {actual}")]
    InvalidCryptoKey { expected: usize, actual: usize },

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("block {hash} is missing from the backup store")]
    BlockNotFound { hash: BlockHash },

    #[error("block does not match its recorded hash {hash}")]
    HashMismatch { hash: BlockHash },

    #[error("deduped map is corrupt: {0}")]
    CorruptMap(String),

    #[error("backup store i/o: {0}")]
    Driver(#[from] std::io::Error),

    #[error("backup worker panicked or was aborted")]
    WorkerLost,
}

impl BackupError {
    pub(crate) fn corrupt_map(msg: impl Into<String>) -> Self {
        Self::CorruptMap(msg.into())
    }
}
