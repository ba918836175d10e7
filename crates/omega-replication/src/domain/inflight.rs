//! Requests awaiting an answer, keyed by a small reusable id.

use omega_core::ProofRequest;

use crate::domain::peer::PeerId;

/// A request sent to one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Id carried on the wire. Never `0`.
    pub id: u64,
    /// Peer the request went to.
    pub peer: PeerId,
    /// What was asked for.
    pub request: ProofRequest,
}

/// Slot table of in-flight requests.
///
/// Ids start at 1 so that `0` can mean "unsolicited". A freed id is handed
/// out again before the table grows, and never while its request is still
/// tracked.
#[derive(Debug, Default)]
pub struct InflightTracker {
    slots: Vec<Option<Request>>,
    free: Vec<u64>,
}

impl InflightTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a request to `peer` and return its id.
    pub fn add(&mut self, peer: PeerId, request: ProofRequest) -> u64 {
        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.slots.push(None);
                self.slots.len() as u64
            }
        };
        self.slots[(id - 1) as usize] = Some(Request { id, peer, request });
        id
    }

    /// Look up request `id`.
    pub fn get(&self, id: u64) -> Option<&Request> {
        if id == 0 {
            return None;
        }
        self.slots.get((id - 1) as usize).and_then(Option::as_ref)
    }

    /// Stop tracking request `id`.
    pub fn remove(&mut self, id: u64) -> Option<Request> {
        if id == 0 {
            return None;
        }
        let request = self.slots.get_mut((id - 1) as usize)?.take()?;
        self.free.push(id);
        Some(request)
    }

    /// Ids of every request sent to `peer`.
    pub fn ids_for(&self, peer: PeerId) -> Vec<u64> {
        self.iter()
            .filter(|r| r.peer == peer)
            .map(|r| r.id)
            .collect()
    }

    /// Every tracked request.
    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.slots.iter().flatten()
    }

    /// Number of tracked requests.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Whether nothing is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
