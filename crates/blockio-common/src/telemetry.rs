//! Telemetry events for failed storage-server operations.
//!
//! Supervised clusters classify every failed server operation and hand it
//! to an injected [`TelemetrySink`]. Classification is observational only:
//! server state transitions come exclusively from the configuration
//! source, never from telemetry.

use std::io::ErrorKind;

use crate::error::Error;
use crate::types::VdiskId;

/// Classification of a failed server operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerEventStatus {
    /// The operation timed out
    ServerTimeout,
    /// A transient transport error
    ServerTempError,
    /// The server closed the connection
    ServerDisconnect,
    /// Anything else
    UnknownError,
}

impl ServerEventStatus {
    /// Classify a transport error by its i/o error kind.
    /// Non-transport errors classify as `UnknownError`.
    #[must_use]
    pub fn classify(err: &Error) -> Self {
        match err.io_kind() {
            Some(ErrorKind::TimedOut | ErrorKind::WouldBlock) => Self::ServerTimeout,
            Some(ErrorKind::Interrupted) => Self::ServerTempError,
            Some(
                ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe,
            ) => Self::ServerDisconnect,
            _ => Self::UnknownError,
        }
    }
}

/// Which role the failing server plays for the vdisk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerRole {
    Primary,
    Template,
}

/// A failed server operation, as reported to the telemetry sink
#[derive(Clone, Debug)]
pub struct ServerEvent {
    pub status: ServerEventStatus,
    pub role: ServerRole,
    pub address: String,
    pub database: i64,
    pub vdisk_id: VdiskId,
}

/// Receiver of server events.
///
/// Injected at cluster construction; implementations must be cheap and
/// non-blocking.
pub trait TelemetrySink: Send + Sync {
    fn server_event(&self, event: ServerEvent);
}

/// A [`TelemetrySink`] that logs events through `tracing`
#[derive(Debug, Default)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn server_event(&self, event: ServerEvent) {
        tracing::warn!(
            status = ?event.status,
            role = ?event.role,
            address = %event.address,
            database = event.database,
            vdisk = %event.vdisk_id,
            "storage server operation failed"
        );
    }
}
