//! Configuration for the replication layer.

use serde::{Deserialize, Serialize};

/// Scheduler and session configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Requests one peer may hold at a time.
    pub max_inflight: usize,
    /// Ask for an upgrade as soon as a peer announces a longer core.
    pub eager_upgrade: bool,
    /// Adopt a peer's history when it is on a newer fork.
    pub allow_fork: bool,
    /// Invalid proofs tolerated before the peer is closed.
    pub max_invalid_responses: u32,
    /// Command queue depth of the session actor.
    pub mailbox_capacity: usize,
    /// Event broadcast buffer.
    pub event_capacity: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            max_inflight: 32,
            eager_upgrade: true,
            allow_fork: true,
            max_invalid_responses: 3,
            mailbox_capacity: 64,
            event_capacity: 256,
        }
    }
}

impl ReplicationConfig {
    /// Small budgets so tests exercise queueing.
    pub fn for_testing() -> Self {
        Self {
            max_inflight: 4,
            mailbox_capacity: 16,
            event_capacity: 64,
            ..Default::default()
        }
    }

    /// Set the per-peer concurrency budget.
    pub fn with_max_inflight(mut self, max_inflight: usize) -> Self {
        self.max_inflight = max_inflight;
        self
    }

    /// Enable or disable eager upgrades.
    pub fn with_eager_upgrade(mut self, eager: bool) -> Self {
        self.eager_upgrade = eager;
        self
    }
}
