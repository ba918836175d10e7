//! # Domain Errors
//!
//! Error types for the Merkle tree, storage and core service.

use omega_crypto::CryptoError;
use thiserror::Error;

/// Hash type alias (32-byte BLAKE3).
pub type Hash = [u8; 32];

/// Core error types.
///
/// Cloneable so a single failure can be handed to every caller awaiting
/// the same block.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    /// A recomputed hash did not match a trusted node.
    #[error("Invalid proof: {0}")]
    InvalidProof(String),

    /// An upgrade or reorg root is not covered by an accepted signature.
    #[error("Remote sent invalid signature")]
    InvalidSignature,

    /// Index beyond any known length.
    #[error("Index {index} out of bounds for length {length}")]
    OutOfBounds {
        /// Requested block or flat index
        index: u64,
        /// Length it was checked against
        length: u64,
    },

    /// Data belongs to a different fork than the one it was checked against.
    #[error("Fork conflict: local fork {local}, remote fork {remote}")]
    ForkConflict {
        /// Local fork id
        local: u64,
        /// Fork id carried by the data
        remote: u64,
    },

    /// A tree node needed for the operation is not stored locally.
    #[error("Tree node {0} is not available")]
    MissingNode(u64),

    /// A block payload is not stored locally.
    #[error("Block {0} is not available")]
    BlockMissing(u64),

    /// The tree moved on between staging a batch and committing it.
    #[error("Tree changed since batch was created")]
    TreeChanged,

    /// No core is stored at this location.
    #[error("No core is stored here")]
    StorageEmpty,

    /// Another core is stored at this location.
    #[error("Another core is stored here")]
    StorageConflict,

    /// The authorization policy cannot sign.
    #[error("Session is not writable")]
    SessionNotWritable,

    /// A locally produced signature, or the key behind it, is not accepted
    /// by the core's authorization policy.
    #[error("Signature is not accepted for this core")]
    Unauthorized,

    /// Caller passed an invalid argument.
    #[error("Bad argument: {0}")]
    BadArgument(String),

    /// Storage I/O failure.
    #[error("Storage I/O failed: {0}")]
    Storage(String),

    /// Header region could not be decoded or encoded.
    #[error("Invalid header: {0}")]
    Header(String),

    /// Crypto primitive failure.
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        CoreError::Storage(err.to_string())
    }
}

impl CoreError {
    /// Shorthand for an invalid proof with a reason.
    pub fn invalid_proof(reason: impl Into<String>) -> Self {
        CoreError::InvalidProof(reason.into())
    }

    /// Whether the error means a peer sent bad data (as opposed to a local failure).
    pub fn is_verification_failure(&self) -> bool {
        matches!(
            self,
            CoreError::InvalidProof(_) | CoreError::InvalidSignature
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_bounds_error() {
        let err = CoreError::OutOfBounds {
            index: 7,
            length: 5,
        };
        assert!(err.to_string().contains("7 out of bounds for length 5"));
    }

    #[test]
    fn test_fork_conflict_error() {
        let err = CoreError::ForkConflict {
            local: 1,
            remote: 2,
        };
        assert!(err.to_string().contains("local fork 1"));
    }

    #[test]
    fn test_io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: CoreError = io.into();
        assert!(matches!(err, CoreError::Storage(ref m) if m.contains("disk gone")));
    }

    #[test]
    fn test_verification_failure_classification() {
        assert!(CoreError::InvalidSignature.is_verification_failure());
        assert!(CoreError::invalid_proof("x").is_verification_failure());
        assert!(!CoreError::TreeChanged.is_verification_failure());
        assert!(!CoreError::Unauthorized.is_verification_failure());
    }
}
