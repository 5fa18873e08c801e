//! Error types shared across the blockio data plane.

use std::sync::Arc;

use thiserror::Error;

/// Common result type for blockio operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for the blockio data plane.
///
/// The enum is `Clone` (transport errors are wrapped in an `Arc`) so that
/// cluster variants which return one fixed error forever can hold a value
/// of it.
#[derive(Debug, Clone, Error)]
pub enum Error {
    // Cluster errors
    #[error("no servers available")]
    NoServersAvailable,

    #[error("server state is not supported")]
    ServerStateNotSupported,

    #[error("server is unavailable")]
    ServerUnavailable,

    #[error("storage cluster is not defined")]
    ClusterNotDefined,

    #[error("method is not supported by this cluster")]
    MethodNotSupported,

    // Reply decoding errors
    #[error("nil reply: key or field is absent")]
    NilReply,

    #[error("unexpected reply type: expected {expected}, got {actual}")]
    WrongType {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("server replied with an error: {0}")]
    ServerError(String),

    #[error("wire protocol violation: {0}")]
    Protocol(String),

    // Caller errors
    #[error("invalid input: {0}")]
    InvalidInput(String),

    // LBA errors
    #[error("shard contains only nil hashes and cannot be written")]
    NilShardWrite,

    // Configuration source errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("vdisk not found: {0}")]
    VdiskNotFound(String),

    #[error("storage cluster not found: {0}")]
    ClusterNotFound(String),

    // Transport errors, returned verbatim to the caller
    #[error("i/o error: {0}")]
    Io(#[source] Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(Arc::new(err))
    }
}

impl Error {
    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a wire protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Check if this error denotes an absent key rather than a failure
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, Self::NilReply)
    }

    /// The underlying i/o error kind, if this is a transport error
    #[must_use]
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            Self::Io(err) => Some(err.kind()),
            _ => None,
        }
    }
}
