//! In-memory connection pair.
//!
//! Both ends share one random handshake hash; the first end is the
//! initiator. Used by tests and to replicate between cores in one process.

use async_trait::async_trait;
use omega_core::Hash;
use rand::RngCore;
use tokio::sync::mpsc;

use crate::domain::errors::ReplicationError;
use crate::ports::Transport;

/// One end of a [`duplex`] pair.
#[derive(Debug)]
pub struct DuplexConnection {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    handshake_hash: Hash,
    is_initiator: bool,
}

/// Two connected ends. The first one initiated.
pub fn duplex() -> (DuplexConnection, DuplexConnection) {
    let mut handshake_hash = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut handshake_hash);

    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        DuplexConnection {
            tx: a_tx,
            rx: a_rx,
            handshake_hash,
            is_initiator: true,
        },
        DuplexConnection {
            tx: b_tx,
            rx: b_rx,
            handshake_hash,
            is_initiator: false,
        },
    )
}

impl DuplexConnection {
    /// Replace the handshake hash, as a man in the middle would see it.
    pub fn with_handshake_hash(mut self, handshake_hash: Hash) -> Self {
        self.handshake_hash = handshake_hash;
        self
    }
}

#[async_trait]
impl Transport for DuplexConnection {
    fn handshake_hash(&self) -> Hash {
        self.handshake_hash
    }

    fn is_initiator(&self) -> bool {
        self.is_initiator
    }

    async fn send(&mut self, bytes: Vec<u8>) -> Result<(), ReplicationError> {
        self.tx
            .send(bytes)
            .map_err(|_| ReplicationError::Disconnected)
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}
