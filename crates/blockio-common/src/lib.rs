//! blockio common - Shared types and utilities
//!
//! This crate provides the types, configuration structures, error
//! definitions and contracts shared by all blockio components.

pub mod config;
pub mod error;
pub mod source;
pub mod telemetry;
pub mod types;

pub use config::{
    ServerState, StorageClusterConfig, StorageServerConfig, VdiskNbdConfig, VdiskStaticConfig,
};
pub use error::{Error, Result};
pub use source::{InMemorySource, Source, SourceKey, SourceKeyKind};
pub use telemetry::{LogSink, ServerEvent, ServerEventStatus, ServerRole, TelemetrySink};
pub use types::{BlockHash, BlockSize, VdiskId, VdiskType, HASH_SIZE};
