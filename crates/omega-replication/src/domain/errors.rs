//! # Replication Errors

use omega_core::CoreError;
use thiserror::Error;

/// Replication error types.
///
/// Cloneable so one failure can reject every caller waiting on the same want.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
    /// Failure inside the local core (verification, storage, bounds).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// The remote's capability does not match this core and connection.
    #[error("Remote sent an invalid capability")]
    InvalidCapability,

    /// The peer connection closed.
    #[error("Peer disconnected")]
    Disconnected,

    /// The want was destroyed before it resolved.
    #[error("Request was cancelled")]
    RequestCancelled,

    /// The session is closed.
    #[error("Session is closed")]
    SessionClosed,

    /// No connected peer claims the block.
    #[error("Block {0} is not available from any peer")]
    BlockNotAvailable(u64),

    /// A frame could not be encoded or decoded.
    #[error("Codec error: {0}")]
    Codec(String),

    /// A storage task on the blocking pool panicked or was cancelled.
    #[error("Storage task failed: {0}")]
    Task(String),
}

impl From<bincode::Error> for ReplicationError {
    fn from(err: bincode::Error) -> Self {
        ReplicationError::Codec(err.to_string())
    }
}
