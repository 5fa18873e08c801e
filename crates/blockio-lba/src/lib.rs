//! blockio LBA - the deduped-map index
//!
//! Persists the `block index -> content hash` mapping of deduped vdisks
//! as fixed-size shards on the meta cluster, with lazy loads, dirty
//! tracking and an LRU-bounded resident set.

pub mod shard;
pub mod store;

pub use shard::{Shard, BYTES_PER_SHARD, RECORDS_PER_SHARD};
pub use store::{meta_key, Lba, DEFAULT_CACHE_LIMIT};
