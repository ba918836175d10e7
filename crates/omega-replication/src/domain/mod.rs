//! Domain layer - scheduling state and wire shapes.
//!
//! - `remote_bitfield`: what a peer claims to have
//! - `block_tracker`, `inflight`, `listeners`: wants, requests and waiters
//! - `peer`, `replicator`: per-peer state and the scheduler
//! - `messages`, `events`: wire messages and session events

pub mod block_tracker;
pub mod errors;
pub mod events;
pub mod inflight;
pub mod listeners;
pub mod messages;
pub mod peer;
pub mod remote_bitfield;
pub mod replicator;

pub use block_tracker::{BlockEntry, BlockTracker, BlockValue};
pub use errors::ReplicationError;
pub use events::CoreEvent;
pub use inflight::{InflightTracker, Request};
pub use listeners::{ready, Listeners, Waiter};
pub use messages::{Message, PeerMessage};
pub use peer::{Peer, PeerId, PeerState};
pub use remote_bitfield::RemoteBitfield;
pub use replicator::{ReplicationStats, Replicator};
