//! # Outbound Ports
//!
//! The byte pipe a session replicates over. Framing, channel multiplexing
//! and capability checks happen above it.

use async_trait::async_trait;
use omega_core::Hash;

use crate::domain::errors::ReplicationError;

/// An established, ordered, reliable connection to one remote.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Hash both ends agreed on during the handshake.
    fn handshake_hash(&self) -> Hash;

    /// Whether this end initiated the connection.
    fn is_initiator(&self) -> bool;

    /// Write bytes. Fails with [`ReplicationError::Disconnected`] once the
    /// remote is gone.
    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ReplicationError>;

    /// Next chunk of bytes, or `None` once the remote closed.
    ///
    /// Chunk boundaries carry no meaning.
    async fn recv(&mut self) -> Option<Vec<u8>>;
}
