use std::io;
use thiserror::Error;

use crate::types::SourceId;

/// Failures of the serial link. Returned to the caller of the bridge
/// operation; the controller logs them and keeps going.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("serial transport is not available on this host")]
    NotAvailable,

    #[error("no serial port selected")]
    PortUnavailable,

    #[error("serial port is not open")]
    NotConnected,

    #[error("failed to open serial port: {0}")]
    OpenFailed(#[source] io::Error),

    #[error("serial write failed: {0}")]
    WriteFailed(#[source] io::Error),

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Failures of a call into the host platform.
#[derive(Debug, Error)]
pub enum HostError {
    #[error("context {0} no longer exists")]
    ContextGone(SourceId),

    #[error("script injection into context {id} failed: {reason}")]
    Injection { id: SourceId, reason: String },

    #[error("host channel closed")]
    Disconnected,
}

/// Failure of the metadata extractor. Registration proceeds with partial
/// metadata when this happens.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata extraction timed out")]
    TimedOut,

    #[error("metadata unavailable: {0}")]
    Unavailable(String),
}
