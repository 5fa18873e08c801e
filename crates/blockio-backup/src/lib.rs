//! blockio backup - vdisk snapshot export and import
//!
//! Extracts a vdisk into content-addressed, compressed and encrypted
//! blocks on a backup store and restores it, reconciling block geometry
//! between the vdisk and the snapshot:
//!
//! - blocks deduplicate by plaintext content hash
//! - each block stores compressed then sealed with AES-256-GCM
//! - the deduped map (`index -> hash`) uploads last, as the snapshot's
//!   single linearization point

pub mod compress;
pub mod config;
pub mod crypto;
pub mod driver;
pub mod error;
pub mod export;
pub mod fetcher;
pub mod import;
pub mod map;

pub use compress::CompressionType;
pub use config::{BackupConfig, DEFAULT_BLOCK_SIZE};
pub use crypto::{Crypter, CryptoKey, KEY_SIZE, NONCE_SIZE};
pub use driver::{block_path, map_path, LocalDriver, MemoryDriver, StorageDriver};
pub use error::{BackupError, Result};
pub use export::export_vdisk;
pub use fetcher::{sized_block_fetcher, BlockFetcher, BlockPair};
pub use import::import_vdisk;
pub use map::{DedupedMap, MAP_MAGIC, MAP_VERSION};
