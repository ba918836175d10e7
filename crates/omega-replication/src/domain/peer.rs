//! One remote endpoint replicating a core with us.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::remote_bitfield::RemoteBitfield;

/// Handle the scheduler uses for a peer. Never reused within a replicator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Lifecycle of a peer channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// We sent `open`, the remote has not confirmed yet.
    Opening,
    /// Both sides opened with matching capabilities.
    Open,
    /// Transport closed or the peer was dropped.
    Closed,
}

/// Scheduler-side view of a remote.
#[derive(Debug)]
pub struct Peer {
    /// Scheduler handle.
    pub id: PeerId,
    /// Channel state.
    pub state: PeerState,
    /// Requests currently assigned to the peer.
    pub inflight: usize,
    /// Concurrency budget.
    pub max_inflight: usize,
    /// Blocks the peer told us it has.
    pub remote_bitfield: RemoteBitfield,
    /// Whether the peer sent its length and fork yet.
    pub remote_signaled: bool,
    /// Fork the peer is on.
    pub remote_fork: u64,
    /// Length the peer announced.
    pub remote_length: u64,
    /// Invalid proofs received so far.
    pub invalid_responses: u32,
    /// `(fork, local length, remote length)` at which an upgrade was refused.
    pub refused_upgrade: Option<(u64, u64, u64)>,
}

impl Peer {
    /// A peer that has not opened yet.
    pub fn new(id: PeerId, max_inflight: usize) -> Self {
        Self {
            id,
            state: PeerState::Opening,
            inflight: 0,
            max_inflight,
            remote_bitfield: RemoteBitfield::new(),
            remote_signaled: false,
            remote_fork: 0,
            remote_length: 0,
            invalid_responses: 0,
            refused_upgrade: None,
        }
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.state == PeerState::Open
    }

    /// Mark the channel closed. Returns whether it had been open.
    pub fn close(&mut self) -> bool {
        let was_open = self.is_open();
        self.state = PeerState::Closed;
        self.inflight = 0;
        was_open
    }

    /// Whether another request may be assigned.
    pub fn has_capacity(&self) -> bool {
        self.is_open() && self.inflight < self.max_inflight
    }

    /// Whether the peer can extend a tree at `(fork, length)`.
    pub fn can_upgrade(&self, fork: u64, length: u64) -> bool {
        self.is_open()
            && self.remote_fork == fork
            && self.remote_length > length
            && self.refused_upgrade != Some((fork, length, self.remote_length))
    }

    /// Whether the peer is on a newer fork than `fork`.
    pub fn can_reorg(&self, fork: u64) -> bool {
        self.is_open() && self.remote_fork > fork
    }

    /// Whether block `index` may be asked of the peer by a tree at
    /// `(fork, length)`.
    ///
    /// The peer must share our fork and be at least as long as we are;
    /// blocks past our length additionally need the peer to reach them.
    pub fn could_serve(&self, index: u64, fork: u64, length: u64) -> bool {
        self.is_open()
            && self.remote_fork == fork
            && self.remote_length >= length
            && index < self.remote_length
            && self.remote_bitfield.get(index)
    }

    /// Record a length and fork announcement.
    ///
    /// Returns whether the peer moved to a different fork.
    pub fn on_info(&mut self, length: u64, fork: u64) -> bool {
        let fork_changed = self.remote_signaled && fork != self.remote_fork;
        if fork_changed {
            self.remote_bitfield = RemoteBitfield::new();
        }
        if length < self.remote_length || fork_changed {
            self.remote_bitfield
                .set_range(length, self.remote_length.saturating_sub(length), false);
        }
        self.remote_signaled = true;
        self.remote_length = length;
        self.remote_fork = fork;
        fork_changed
    }

    /// Forget the refused upgrade once the situation that caused it changed.
    pub fn clear_refusal(&mut self, fork: u64, length: u64) {
        if self
            .refused_upgrade
            .is_some_and(|(f, l, r)| f != fork || l != length || r != self.remote_length)
        {
            self.refused_upgrade = None;
        }
    }
}
