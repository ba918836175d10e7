//! Events a session reports to its subscribers.

use serde::{Deserialize, Serialize};

use crate::domain::peer::PeerId;

/// Something that happened to the core or its peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoreEvent {
    /// The core grew, locally or through an upgrade.
    Append {
        /// New length.
        length: u64,
    },
    /// A block was verified and stored.
    Download {
        /// Block index.
        index: u64,
    },
    /// A block was served to a peer.
    Upload {
        /// Block index.
        index: u64,
    },
    /// The writer rolled the core back.
    Truncate {
        /// New length.
        length: u64,
        /// New fork.
        fork: u64,
    },
    /// A remote fork was adopted.
    Reorg {
        /// New fork.
        fork: u64,
        /// Blocks kept from the old history.
        ancestors: u64,
    },
    /// A peer opened a channel for the core.
    PeerAdd {
        /// The peer.
        peer: PeerId,
    },
    /// A peer went away.
    PeerRemove {
        /// The peer.
        peer: PeerId,
    },
    /// A message for a registered extension arrived.
    Extension {
        /// Sender.
        peer: PeerId,
        /// Extension name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
}
