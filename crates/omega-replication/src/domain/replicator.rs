//! # Replicator
//!
//! Decides which peer is asked for what, and routes the answers back to the
//! callers waiting on them.
//!
//! The replicator performs no I/O. Every entry point takes the [`Core`] it
//! schedules for, and anything that must go on the wire is queued in an
//! outbox that the owner drains after each call (see
//! [`drain_outbox`](Replicator::drain_outbox)).
//!
//! ## Scheduling
//!
//! After every state change each peer is visited in random order:
//!
//! 1. **Primary pass**: unsent seeks, then queued block wants the peer
//!    claims to have. A peer that got work is visited again.
//! 2. **Secondary pass**: range downloads, fork reconciliation rounds and
//!    upgrades.
//!
//! Requests for blocks past the local length carry an upgrade. At most one
//! upgrade at the local fork is in flight across all peers.
//!
//! ## Failure Policy
//!
//! A `noData` or an invalid proof drops the peer's claim on what was asked
//! and hands the want to the next pass. Invalid proofs count against the
//! peer; at `max_invalid_responses` it is closed.

use std::collections::{BTreeSet, HashSet, VecDeque};

use omega_core::{
    Core, CoreError, Proof, ProofRequest, ReorgBatch, RequestSeek, RequestUpgrade, Seeker,
    VerifyOutcome, BITS_PER_PAGE,
};
use omega_telemetry::{
    log_peer_event, metric_inc, BLOCKS_DOWNLOADED, BLOCKS_UPLOADED, INFLIGHT_REQUESTS,
    INVALID_RESPONSES, PEERS_CONNECTED, REORGS_APPLIED,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::config::ReplicationConfig;
use crate::domain::block_tracker::{BlockTracker, BlockValue};
use crate::domain::errors::ReplicationError;
use crate::domain::events::CoreEvent;
use crate::domain::inflight::{InflightTracker, Request};
use crate::domain::listeners::{ready, Listeners, Waiter};
use crate::domain::messages::PeerMessage;
use crate::domain::peer::{Peer, PeerId, PeerState};

#[derive(Debug)]
struct SeekWant {
    fork: u64,
    seeker: Seeker,
    inflight: Vec<u64>,
    listeners: Listeners<(u64, u64)>,
}

#[derive(Debug)]
struct UpgradeWant {
    fork: u64,
    length: u64,
    listeners: Listeners<bool>,
}

#[derive(Debug)]
struct ReorgAttempt {
    fork: u64,
    inflight: Vec<u64>,
    batch: Option<ReorgBatch>,
    refused: HashSet<PeerId>,
}

impl ReorgAttempt {
    fn new(fork: u64) -> Self {
        Self {
            fork,
            inflight: Vec::new(),
            batch: None,
            refused: HashSet::new(),
        }
    }

    fn finished(&self) -> bool {
        self.batch.as_ref().is_some_and(|b| b.finished)
    }
}

#[derive(Debug)]
struct RangeWant {
    id: u64,
    fork: u64,
    start: u64,
    cursor: u64,
    end: Option<u64>,
    linear: bool,
    listeners: Listeners<()>,
}

/// Replication scheduler for one core.
#[derive(Debug)]
pub struct Replicator {
    config: ReplicationConfig,
    peers: Vec<Peer>,
    next_peer_id: u64,
    next_want_id: u64,
    inflight: InflightTracker,
    blocks: BlockTracker,
    queued: Vec<(u64, u64)>,
    seeks: Vec<SeekWant>,
    upgrade: Option<UpgradeWant>,
    reorgs: Vec<ReorgAttempt>,
    ranges: Vec<RangeWant>,
    applying_reorg: bool,
    closed: bool,
    outbox: VecDeque<(PeerId, PeerMessage)>,
    events: Vec<CoreEvent>,
    extensions: BTreeSet<String>,
    downloaded: u64,
    uploaded: u64,
}

/// Transfer counters of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReplicationStats {
    /// Blocks verified and stored from peers.
    pub downloaded_blocks: u64,
    /// Blocks served to peers.
    pub uploaded_blocks: u64,
    /// Peers with an open channel.
    pub open_peers: usize,
    /// Requests awaiting an answer.
    pub inflight_requests: usize,
}

impl Replicator {
    /// Scheduler for a core currently at `fork`.
    pub fn new(config: ReplicationConfig, fork: u64) -> Self {
        Self {
            config,
            peers: Vec::new(),
            next_peer_id: 0,
            next_want_id: 0,
            inflight: InflightTracker::new(),
            blocks: BlockTracker::new(fork),
            queued: Vec::new(),
            seeks: Vec::new(),
            upgrade: None,
            reorgs: Vec::new(),
            ranges: Vec::new(),
            applying_reorg: false,
            closed: false,
            outbox: VecDeque::new(),
            events: Vec::new(),
            extensions: BTreeSet::new(),
            downloaded: 0,
            uploaded: 0,
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Configuration in use.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Known peers.
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    /// Peer `id`, if still known.
    pub fn peer(&self, id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == id)
    }

    /// Requests awaiting an answer.
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Block wants waiting for a peer.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Take every message queued for the wire.
    pub fn drain_outbox(&mut self) -> Vec<(PeerId, PeerMessage)> {
        self.outbox.drain(..).collect()
    }

    /// Take every event raised since the last call.
    pub fn drain_events(&mut self) -> Vec<CoreEvent> {
        std::mem::take(&mut self.events)
    }

    /// Transfer counters since the session started.
    pub fn stats(&self) -> ReplicationStats {
        ReplicationStats {
            downloaded_blocks: self.downloaded,
            uploaded_blocks: self.uploaded,
            open_peers: self.peers.iter().filter(|p| p.is_open()).count(),
            inflight_requests: self.inflight.len(),
        }
    }

    // =========================================================================
    // Peer lifecycle
    // =========================================================================

    /// Register a peer whose channel is being opened.
    pub fn add_peer(&mut self) -> PeerId {
        self.next_peer_id += 1;
        let id = PeerId(self.next_peer_id);
        self.peers.push(Peer::new(id, self.config.max_inflight));
        log_peer_event!(trace, id, "peer added");
        id
    }

    /// The remote confirmed the channel. Sends our bitfield and length.
    pub fn on_remote_open(&mut self, core: &Core, peer: PeerId) {
        if self.closed {
            return;
        }
        let Some(pi) = self.peer_index(peer) else {
            return;
        };
        if self.peers[pi].state != PeerState::Opening {
            return;
        }

        self.peers[pi].state = PeerState::Open;
        PEERS_CONNECTED.inc();
        log_peer_event!(debug, peer, "peer opened", length = core.length(), fork = core.fork());
        self.events.push(CoreEvent::PeerAdd { peer });

        // Pages go first so the remote knows our claims when it sees our length.
        for (page, words) in core.bitfield().pages() {
            if words.iter().any(|w| *w != 0) {
                self.outbox.push_back((
                    peer,
                    PeerMessage::Bitfield {
                        start: page * BITS_PER_PAGE,
                        page: words.to_vec(),
                    },
                ));
            }
        }
        self.outbox.push_back((
            peer,
            PeerMessage::Info {
                length: core.length(),
                fork: core.fork(),
            },
        ));

        self.update_all(core);
    }

    /// Drop a peer. Its requests go back to the pool.
    ///
    /// Returns the departed peer, now [`PeerState::Closed`].
    pub fn remove_peer(&mut self, core: &Core, peer: PeerId) -> Option<Peer> {
        let pi = self.peer_index(peer)?;
        let mut removed = self.peers.remove(pi);
        let was_open = removed.close();

        let ids = self.inflight.ids_for(peer);
        for id in &ids {
            if let Some(request) = self.inflight.remove(*id) {
                INFLIGHT_REQUESTS.dec();
                self.detach_request(&request);
            }
        }
        for attempt in &mut self.reorgs {
            attempt.refused.remove(&peer);
        }

        log_peer_event!(debug, peer, "peer removed", requests = ids.len());
        if was_open {
            PEERS_CONNECTED.dec();
            self.events.push(CoreEvent::PeerRemove { peer });
        }
        self.update_all(core);
        Some(removed)
    }

    /// Handle a message from `peer`.
    pub fn on_message(&mut self, core: &mut Core, peer: PeerId, message: PeerMessage) {
        if self.closed {
            return;
        }
        let Some(pi) = self.peer_index(peer) else {
            trace!(%peer, "message from unknown peer");
            return;
        };
        if !self.peers[pi].is_open() {
            log_peer_event!(trace, peer, "message before open");
            return;
        }

        match message {
            PeerMessage::Info { length, fork } => self.on_info(core, pi, length, fork),
            PeerMessage::Have { start, length } => {
                self.peers[pi].remote_bitfield.set_range(start, length, true);
                self.update_all(core);
            }
            PeerMessage::Bitfield { start, page } => {
                self.peers[pi]
                    .remote_bitfield
                    .set_page(start / BITS_PER_PAGE, &page);
                self.update_all(core);
            }
            PeerMessage::Range {
                start,
                length,
                drop,
            } => {
                self.peers[pi].remote_bitfield.set_range(start, length, !drop);
                self.update_all(core);
            }
            PeerMessage::Request { id, request } => self.on_request(core, pi, id, request),
            PeerMessage::Data { request, proof } => self.on_data(core, pi, request, proof),
            PeerMessage::NoData { request } => self.on_no_data(core, pi, request),
            PeerMessage::Extension { name, payload } => {
                if self.extensions.contains(&name) {
                    self.events.push(CoreEvent::Extension {
                        peer,
                        name,
                        payload,
                    });
                } else {
                    log_peer_event!(trace, peer, "unregistered extension dropped", name = %name);
                }
            }
            PeerMessage::Close => {
                self.remove_peer(core, peer);
            }
        }
    }

    /// Reject every waiter and say goodbye to every peer.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        for entry in self.blocks.iter_mut() {
            entry.reject(ReplicationError::SessionClosed);
        }
        self.blocks = BlockTracker::new(self.blocks.fork());
        self.queued.clear();
        for mut seek in self.seeks.drain(..) {
            seek.listeners.reject(ReplicationError::SessionClosed);
        }
        for mut range in self.ranges.drain(..) {
            range.listeners.reject(ReplicationError::SessionClosed);
        }
        if let Some(mut want) = self.upgrade.take() {
            want.listeners.reject(ReplicationError::SessionClosed);
        }
        self.reorgs.clear();

        for peer in &self.peers {
            if peer.is_open() {
                PEERS_CONNECTED.dec();
                self.outbox.push_back((peer.id, PeerMessage::Close));
            }
        }
        self.peers.clear();
        INFLIGHT_REQUESTS.sub(self.inflight.len() as f64);
        self.inflight = InflightTracker::new();
        debug!("replicator closed");
    }

    // =========================================================================
    // Wants
    // =========================================================================

    /// Wait for block `index`.
    ///
    /// With `if_available` the waiter fails with
    /// [`ReplicationError::BlockNotAvailable`] once no peer claims the block.
    pub fn request_block(&mut self, core: &Core, index: u64, if_available: bool) -> Waiter<BlockValue> {
        if self.closed {
            return ready(Err(ReplicationError::SessionClosed));
        }
        if core.has(index) {
            return ready(block_value(core, index));
        }

        let fork = core.fork();
        let entry = self.blocks.add(fork, index);
        let waiter = entry.attach(if_available);
        if entry.inflight.is_empty() && !entry.queued {
            entry.queued = true;
            self.queued.push((fork, index));
        }

        self.update_all(core);
        waiter
    }

    /// Wait until the core grows or forks. Resolves `false` when no peer can
    /// extend it.
    pub fn request_upgrade(&mut self, core: &mut Core) -> Waiter<bool> {
        if self.closed {
            return ready(Err(ReplicationError::SessionClosed));
        }
        if core.writable() {
            return ready(Ok(false));
        }

        let waiter = self.add_upgrade(core).listeners.attach();
        if let Some(ai) = self.reorgs.iter().rposition(ReorgAttempt::finished) {
            self.apply_reorg(core, ai);
        }
        self.update_all(core);
        waiter
    }

    /// Resolve byte offset `bytes` to `(block, offset within block)`.
    pub fn request_seek(&mut self, core: &Core, bytes: u64) -> Waiter<(u64, u64)> {
        if self.closed {
            return ready(Err(ReplicationError::SessionClosed));
        }

        let mut seeker = core.seek(bytes);
        match core.update_seeker(&mut seeker) {
            Ok(Some(found)) => return ready(Ok(found)),
            Err(err) => return ready(Err(err.into())),
            Ok(None) => {}
        }

        let mut listeners = Listeners::new();
        let waiter = listeners.attach();
        self.seeks.push(SeekWant {
            fork: core.fork(),
            seeker,
            inflight: Vec::new(),
            listeners,
        });
        self.update_all(core);
        waiter
    }

    /// Download `[start, end)`, or everything from `start` on when `end` is
    /// `None`. Returns the range id and a waiter for completion.
    pub fn add_range(
        &mut self,
        core: &Core,
        start: u64,
        end: Option<u64>,
        linear: bool,
    ) -> (u64, Waiter<()>) {
        if self.closed {
            return (0, ready(Err(ReplicationError::SessionClosed)));
        }

        self.next_want_id += 1;
        let id = self.next_want_id;
        let mut listeners = Listeners::new();
        let waiter = listeners.attach();
        self.ranges.push(RangeWant {
            id,
            fork: core.fork(),
            start,
            cursor: start,
            end,
            linear,
            listeners,
        });
        debug!(id, start, ?end, linear, "range added");

        self.update_ranges(core);
        self.update_all(core);
        (id, waiter)
    }

    /// Stop tracking range `id`. Requests already sent still complete.
    pub fn destroy_range(&mut self, id: u64) -> bool {
        let Some(pos) = self.ranges.iter().position(|r| r.id == id) else {
            return false;
        };
        let mut range = self.ranges.swap_remove(pos);
        range.listeners.reject(ReplicationError::RequestCancelled);
        debug!(id, "range destroyed");
        true
    }

    // =========================================================================
    // Local changes
    // =========================================================================

    /// The writer appended blocks `[start, length)`.
    pub fn on_append(&mut self, core: &Core, start: u64) {
        let length = core.length();
        if length > start {
            self.broadcast(
                None,
                PeerMessage::Have {
                    start,
                    length: length - start,
                },
            );
        }
        self.broadcast(
            None,
            PeerMessage::Info {
                length,
                fork: core.fork(),
            },
        );
        self.events.push(CoreEvent::Append { length });

        self.refresh(core);
        self.update_all(core);
    }

    /// Blocks in `[start, end)` were released from local storage.
    pub fn on_clear(&mut self, core: &Core, start: u64, end: u64) {
        let end = end.min(core.length());
        if end > start {
            self.broadcast(
                None,
                PeerMessage::Range {
                    start,
                    length: end - start,
                    drop: true,
                },
            );
        }
        self.update_all(core);
    }

    /// The writer truncated from `previous_length`.
    pub fn on_truncate(&mut self, core: &Core, previous_length: u64) {
        let length = core.length();
        let fork = core.fork();
        self.events.push(CoreEvent::Truncate { length, fork });

        self.rebase(core);
        if previous_length > length {
            self.broadcast(
                None,
                PeerMessage::Range {
                    start: length,
                    length: previous_length - length,
                    drop: true,
                },
            );
        }
        self.broadcast(None, PeerMessage::Info { length, fork });

        self.refresh(core);
        self.update_all(core);
    }

    // =========================================================================
    // Extensions
    // =========================================================================

    /// Accept messages for extension `name` and report them as events.
    pub fn register_extension(&mut self, name: &str) {
        if self.extensions.insert(name.to_string()) {
            debug!(name, "extension registered");
        }
    }

    /// Send an extension message to `peer`, or to every open peer.
    pub fn send_extension(
        &mut self,
        peer: Option<PeerId>,
        name: &str,
        payload: Vec<u8>,
    ) -> Result<(), ReplicationError> {
        let message = PeerMessage::Extension {
            name: name.to_string(),
            payload,
        };
        match peer {
            None => self.broadcast(None, message),
            Some(peer) => {
                if !self.peer(peer).is_some_and(Peer::is_open) {
                    return Err(ReplicationError::Disconnected);
                }
                self.outbox.push_back((peer, message));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn on_info(&mut self, core: &Core, pi: usize, length: u64, fork: u64) {
        let peer = &mut self.peers[pi];
        let moved = peer.on_info(length, fork);
        peer.clear_refusal(core.fork(), core.length());
        log_peer_event!(trace, peer.id, "remote info", length = length, fork = fork, moved = moved);

        if !core.writable() {
            if fork > core.fork() {
                if self.config.allow_fork {
                    self.add_reorg(core, fork);
                }
            } else if fork == core.fork() && length > core.length() && self.config.eager_upgrade {
                self.add_upgrade(core);
            }
        }
        self.update_all(core);
    }

    fn on_request(&mut self, core: &Core, pi: usize, id: u64, request: ProofRequest) {
        let peer = self.peers[pi].id;
        let reply = match core.proof(&request) {
            Ok(proof) => {
                if let Some(block) = &proof.block {
                    metric_inc!(BLOCKS_UPLOADED);
                    self.uploaded += 1;
                    self.events.push(CoreEvent::Upload { index: block.index });
                }
                PeerMessage::Data { request: id, proof }
            }
            Err(err) => {
                log_peer_event!(debug, peer, "cannot answer request", id = id, error = %err);
                PeerMessage::NoData { request: id }
            }
        };
        self.outbox.push_back((peer, reply));
    }

    fn on_data(&mut self, core: &mut Core, pi: usize, id: u64, proof: Proof) {
        let peer = self.peers[pi].id;
        let Some(request) = self.inflight.get(id).cloned() else {
            if proof.fork > core.fork() {
                self.on_reorg_data(core, pi, None, &proof);
            } else {
                log_peer_event!(trace, peer, "unsolicited data dropped", id = id);
            }
            return;
        };
        if request.peer != peer {
            log_peer_event!(debug, peer, "answer to another peer's request", id = id);
            return;
        }
        self.finish_request(pi, id);

        // The peer moved to a newer fork since we asked; its answer is the
        // opening of a reorg, not bad data.
        if proof.fork != request.request.fork && proof.fork > core.fork() {
            self.detach_request(&request);
            self.on_reorg_data(core, pi, None, &proof);
            return;
        }
        if proof.fork != request.request.fork || !proof.matches(&request.request) {
            self.reject_response(core, pi, &request, "mismatch");
            return;
        }
        if request.request.fork > core.fork() {
            self.on_reorg_data(core, pi, Some(&request), &proof);
            return;
        }
        if request.request.fork < core.fork() {
            self.detach_request(&request);
            self.update_all(core);
            return;
        }

        match core.verify(&proof) {
            Ok(outcome) => self.on_verified(core, pi, &request, outcome),
            Err(err) if err.is_verification_failure() => {
                let reason = failure_reason(&err);
                self.reject_response(core, pi, &request, reason);
            }
            Err(err @ (CoreError::TreeChanged | CoreError::ForkConflict { .. })) => {
                log_peer_event!(trace, peer, "stale answer", id = id, error = %err);
                self.detach_request(&request);
                self.update_all(core);
            }
            Err(err) => {
                warn!(%peer, id, error = %err, "storing verified data failed");
                self.fail_request(&request, err.into());
                self.detach_request(&request);
                self.update_all(core);
            }
        }
    }

    fn on_verified(&mut self, core: &Core, pi: usize, request: &Request, outcome: VerifyOutcome) {
        let peer = self.peers[pi].id;

        if let Some(index) = outcome.downloaded {
            metric_inc!(BLOCKS_DOWNLOADED);
            self.downloaded += 1;
            log_peer_event!(trace, peer, "block downloaded", index = index);
            self.events.push(CoreEvent::Download { index });
            self.broadcast(
                Some(peer),
                PeerMessage::Have {
                    start: index,
                    length: 1,
                },
            );
        }
        if outcome.upgraded {
            log_peer_event!(debug, peer, "upgraded", length = outcome.length, fork = outcome.fork);
            self.events.push(CoreEvent::Append {
                length: outcome.length,
            });
            self.broadcast(
                None,
                PeerMessage::Info {
                    length: outcome.length,
                    fork: outcome.fork,
                },
            );
            for p in &mut self.peers {
                p.clear_refusal(outcome.fork, outcome.length);
            }
        }

        // Resolve first so the finished block is not requeued by the detach.
        self.refresh(core);
        self.detach_request(request);
        self.update_all(core);
    }

    fn on_no_data(&mut self, core: &Core, pi: usize, id: u64) {
        let peer_id = self.peers[pi].id;
        let Some(request) = self.inflight.get(id).cloned() else {
            return;
        };
        if request.peer != peer_id {
            return;
        }
        self.finish_request(pi, id);

        let fork = core.fork();
        let peer = &mut self.peers[pi];
        if let Some(block) = request.request.block {
            peer.remote_bitfield.set(block.index, false);
        }
        if request.request.upgrade.is_some() && request.request.fork == fork {
            peer.refused_upgrade = Some((fork, core.length(), peer.remote_length));
        }
        if request.request.fork > fork {
            for attempt in &mut self.reorgs {
                if attempt.fork == request.request.fork {
                    attempt.refused.insert(peer_id);
                }
            }
        }
        log_peer_event!(debug, peer_id, "request refused", id = id);

        self.detach_request(&request);
        self.update_all(core);
    }

    // =========================================================================
    // Fork reconciliation
    // =========================================================================

    fn on_reorg_data(&mut self, core: &mut Core, pi: usize, request: Option<&Request>, proof: &Proof) {
        let peer = self.peers[pi].id;
        if let Some(request) = request {
            self.detach_request(request);
        }
        if !self.config.allow_fork || core.writable() {
            self.update_all(core);
            return;
        }
        let Some(ai) = self.add_reorg(core, proof.fork) else {
            self.update_all(core);
            return;
        };

        let attempt = &mut self.reorgs[ai];
        if request.is_none() && attempt.batch.is_some() {
            self.update_all(core);
            return;
        }
        let result = match attempt.batch.as_mut() {
            Some(batch) => core.update_reorg(batch, proof),
            None => core.reorg(proof).map(|batch| attempt.batch = Some(batch)),
        };

        if let Err(err) = result {
            attempt.refused.insert(peer);
            log_peer_event!(warn, peer, "reorg proof rejected", fork = proof.fork, error = %err);
            if err.is_verification_failure() && self.penalize(pi, failure_reason(&err)) {
                self.close_peer(core, peer);
                return;
            }
            self.update_all(core);
            return;
        }

        if self.reorgs[ai].finished() && (self.config.eager_upgrade || self.upgrade.is_some()) {
            self.apply_reorg(core, ai);
        }
        self.update_all(core);
    }

    fn apply_reorg(&mut self, core: &mut Core, ai: usize) {
        let attempt = self.reorgs.remove(ai);
        let Some(batch) = attempt.batch else {
            return;
        };
        if attempt.fork <= core.fork() {
            debug!(fork = attempt.fork, local = core.fork(), "dropping stale reorg");
            self.reorgs.retain(|a| a.fork > core.fork());
            return;
        }

        self.applying_reorg = true;
        match core.apply_reorg(batch) {
            Ok(outcome) => {
                metric_inc!(REORGS_APPLIED);
                info!(
                    fork = outcome.fork,
                    ancestors = outcome.ancestors,
                    length = outcome.length,
                    "adopted remote fork"
                );
                self.events.push(CoreEvent::Reorg {
                    fork: outcome.fork,
                    ancestors: outcome.ancestors,
                });
                self.reorgs.retain(|a| a.fork > outcome.fork);
                self.rebase(core);

                if outcome.previous_length > outcome.ancestors {
                    self.broadcast(
                        None,
                        PeerMessage::Range {
                            start: outcome.ancestors,
                            length: outcome.previous_length - outcome.ancestors,
                            drop: true,
                        },
                    );
                }
                self.broadcast(
                    None,
                    PeerMessage::Info {
                        length: outcome.length,
                        fork: outcome.fork,
                    },
                );
            }
            Err(err) => {
                warn!(fork = attempt.fork, error = %err, "applying reorg failed");
                if let Some(mut want) = self.upgrade.take() {
                    want.listeners.reject(err.into());
                }
            }
        }
        self.applying_reorg = false;

        for peer in &mut self.peers {
            peer.clear_refusal(core.fork(), core.length());
        }
        self.refresh(core);
    }

    fn add_reorg(&mut self, core: &Core, fork: u64) -> Option<usize> {
        if fork <= core.fork() {
            return None;
        }
        match self.reorgs.binary_search_by_key(&fork, |a| a.fork) {
            Ok(ai) => Some(ai),
            Err(ai) => {
                debug!(fork, local = core.fork(), "tracking remote fork");
                self.reorgs.insert(ai, ReorgAttempt::new(fork));
                Some(ai)
            }
        }
    }

    // =========================================================================
    // Scheduling
    // =========================================================================

    fn update_all(&mut self, core: &Core) {
        if self.applying_reorg || self.closed {
            return;
        }

        let mut order: Vec<usize> = (0..self.peers.len()).collect();
        order.shuffle(&mut rand::thread_rng());

        let mut queue: VecDeque<usize> = order.iter().copied().collect();
        while let Some(pi) = queue.pop_front() {
            if self.update_peer(core, pi) {
                queue.push_back(pi);
            }
        }
        for &pi in &order {
            while self.update_peer_non_primary(core, pi) {}
        }

        self.check_availability(core);
    }

    fn update_peer(&mut self, core: &Core, pi: usize) -> bool {
        if !self.peers[pi].has_capacity() {
            return false;
        }
        let fork = core.fork();

        for si in 0..self.seeks.len() {
            if self.seeks[si].fork != fork || !self.seeks[si].inflight.is_empty() {
                continue;
            }
            let seeker = self.seeks[si].seeker;
            if let Some(request) = self.seek_request(core, pi, seeker) {
                let id = self.send_request(core, pi, request);
                self.seeks[si].inflight.push(id);
                return true;
            }
        }

        let len = self.queued.len();
        if len == 0 {
            return false;
        }
        let offset = rand::thread_rng().gen_range(0..len);
        for k in 0..len {
            let qi = (offset + k) % len;
            let (qfork, index) = self.queued[qi];
            let stale = qfork != fork
                || core.has(index)
                || self.blocks.get(qfork, index).map_or(true, |b| {
                    !b.queued || !b.inflight.is_empty() || !b.has_listeners()
                });
            if stale {
                self.queued.swap_remove(qi);
                self.settle_queued(core, qfork, index);
                return true;
            }

            if !self.peers[pi].could_serve(index, fork, core.length()) {
                continue;
            }
            let Some(request) = self.block_request(core, pi, index) else {
                continue;
            };
            self.queued.swap_remove(qi);
            let id = self.send_request(core, pi, request);
            if let Some(entry) = self.blocks.get_mut(fork, index) {
                entry.queued = false;
                entry.inflight.push(id);
            }
            return true;
        }
        false
    }

    fn update_peer_non_primary(&mut self, core: &Core, pi: usize) -> bool {
        if !self.peers[pi].has_capacity() {
            return false;
        }
        let fork = core.fork();

        if !self.ranges.is_empty() {
            let upgradable = self.should_upgrade(core, pi);
            let len = self.ranges.len();
            let offset = rand::thread_rng().gen_range(0..len);
            for k in 0..len {
                let ri = (offset + k) % len;
                if self.ranges[ri].fork != fork {
                    continue;
                }
                let Some(index) = self.range_candidate(core, pi, ri, upgradable) else {
                    continue;
                };
                let Some(request) = self.block_request(core, pi, index) else {
                    continue;
                };
                let id = self.send_request(core, pi, request);
                self.blocks.add(fork, index).inflight.push(id);
                return true;
            }
        }

        if self.config.allow_fork {
            let peer = &self.peers[pi];
            let mut next = None;
            for ai in (0..self.reorgs.len()).rev() {
                let attempt = &self.reorgs[ai];
                if !attempt.inflight.is_empty()
                    || attempt.refused.contains(&peer.id)
                    || attempt.fork != peer.remote_fork
                {
                    continue;
                }
                let request = match &attempt.batch {
                    None if peer.remote_length > 0 => {
                        ProofRequest::upgrade(attempt.fork, 0, peer.remote_length)
                    }
                    Some(batch) if !batch.finished => match batch.request() {
                        Some(request) => request,
                        None => continue,
                    },
                    _ => continue,
                };
                next = Some((ai, request));
                break;
            }
            if let Some((ai, request)) = next {
                let id = self.send_request(core, pi, request);
                self.reorgs[ai].inflight.push(id);
                return true;
            }
        }

        if self.upgrade.is_some() && self.should_upgrade(core, pi) {
            let request = ProofRequest {
                fork,
                upgrade: Some(self.upgrade_part(core, pi)),
                ..Default::default()
            };
            self.send_request(core, pi, request);
            return true;
        }
        false
    }

    /// Next block of range `ri` to ask peer `pi` for.
    fn range_candidate(&self, core: &Core, pi: usize, ri: usize, upgradable: bool) -> Option<u64> {
        let range = &self.ranges[ri];
        let peer = &self.peers[pi];
        let fork = core.fork();
        let length = core.length();

        let end = range
            .end
            .unwrap_or(length.max(peer.remote_length))
            .min(peer.remote_length);
        if range.cursor >= end {
            return None;
        }

        let eligible = |index: u64| {
            !core.has(index)
                && (index < length || upgradable)
                && self
                    .blocks
                    .get(fork, index)
                    .map_or(true, |b| b.inflight.is_empty())
                && peer.could_serve(index, fork, length)
        };

        if range.linear {
            return (range.cursor..end).find(|&i| eligible(i));
        }
        let span = end - range.cursor;
        let offset = rand::thread_rng().gen_range(0..span);
        (0..span)
            .map(|k| range.cursor + (offset + k) % span)
            .find(|&i| eligible(i))
    }

    fn block_request(&self, core: &Core, pi: usize, index: u64) -> Option<ProofRequest> {
        let mut request = ProofRequest::block(core.fork(), index, 0);
        if index >= core.length() {
            if !self.should_upgrade(core, pi) {
                return None;
            }
            request.upgrade = Some(self.upgrade_part(core, pi));
        } else if self.config.eager_upgrade
            && self.upgrade.is_some()
            && self.should_upgrade(core, pi)
        {
            request.upgrade = Some(self.upgrade_part(core, pi));
        }
        Some(request)
    }

    fn seek_request(&self, core: &Core, pi: usize, seeker: Seeker) -> Option<ProofRequest> {
        let peer = &self.peers[pi];
        let fork = core.fork();
        let seek = Some(RequestSeek {
            bytes: seeker.bytes,
        });

        // A seek path ends at one of the peer's roots, which are only ours
        // when the lengths agree. Otherwise the roots ride on an upgrade.
        if seeker.needs_upgrade() || peer.remote_length > core.length() {
            if !self.should_upgrade(core, pi) {
                return None;
            }
            return Some(ProofRequest {
                fork,
                seek,
                upgrade: Some(self.upgrade_part(core, pi)),
                ..Default::default()
            });
        }
        if peer.remote_fork != fork || peer.remote_length != core.length() {
            return None;
        }
        Some(ProofRequest {
            fork,
            seek,
            ..Default::default()
        })
    }

    fn upgrade_part(&self, core: &Core, pi: usize) -> RequestUpgrade {
        let length = core.length();
        RequestUpgrade {
            start: length,
            length: self.peers[pi].remote_length.saturating_sub(length),
        }
    }

    fn should_upgrade(&self, core: &Core, pi: usize) -> bool {
        !self.upgrade_inflight(core) && self.peers[pi].can_upgrade(core.fork(), core.length())
    }

    fn upgrade_inflight(&self, core: &Core) -> bool {
        let fork = core.fork();
        self.inflight
            .iter()
            .any(|r| r.request.fork == fork && r.request.upgrade.is_some())
    }

    fn send_request(&mut self, core: &Core, pi: usize, mut request: ProofRequest) -> u64 {
        if let Some(block) = request.block.as_mut() {
            let index = block.index;
            block.nodes = core.missing_nodes(2 * index).unwrap_or_else(|err| {
                warn!(index, error = %err, "asking for the full path");
                u64::MAX
            });
        }

        let peer = &mut self.peers[pi];
        peer.inflight += 1;
        let peer_id = peer.id;
        let id = self.inflight.add(peer_id, request.clone());
        INFLIGHT_REQUESTS.inc();

        log_peer_event!(
            trace,
            peer_id,
            "request sent",
            id = id,
            fork = request.fork,
            block = ?request.block.map(|b| b.index),
            upgrade = request.upgrade.is_some()
        );
        self.outbox
            .push_back((peer_id, PeerMessage::Request { id, request }));
        id
    }

    fn finish_request(&mut self, pi: usize, id: u64) {
        if self.inflight.remove(id).is_some() {
            INFLIGHT_REQUESTS.dec();
        }
        let peer = &mut self.peers[pi];
        peer.inflight = peer.inflight.saturating_sub(1);
    }

    /// Unlink a finished or failed request from the wants it served.
    fn detach_request(&mut self, request: &Request) {
        let fork = request.request.fork;
        if let Some(block) = request.request.block {
            let mut requeue = false;
            if let Some(entry) = self.blocks.get_mut(fork, block.index) {
                entry.detach(request.id);
                if entry.inflight.is_empty() && entry.has_listeners() && !entry.queued {
                    entry.queued = true;
                    requeue = true;
                }
            }
            if requeue {
                self.queued.push((fork, block.index));
            } else {
                self.blocks.remove_if_idle(fork, block.index);
            }
        }
        for seek in &mut self.seeks {
            seek.inflight.retain(|id| *id != request.id);
        }
        for attempt in &mut self.reorgs {
            attempt.inflight.retain(|id| *id != request.id);
        }
    }

    /// Fail every waiter of `request` after a local error.
    fn fail_request(&mut self, request: &Request, err: ReplicationError) {
        if let Some(block) = request.request.block {
            if let Some(mut entry) = self.blocks.remove(request.request.fork, block.index) {
                entry.reject(err.clone());
            }
        }
        if request.request.upgrade.is_some() {
            if let Some(mut want) = self.upgrade.take() {
                want.listeners.reject(err.clone());
            }
        }
        let mut i = 0;
        while i < self.seeks.len() {
            if self.seeks[i].inflight.contains(&request.id) {
                let mut seek = self.seeks.swap_remove(i);
                seek.listeners.reject(err.clone());
            } else {
                i += 1;
            }
        }
    }

    fn settle_queued(&mut self, core: &Core, fork: u64, index: u64) {
        if let Some(entry) = self.blocks.get_mut(fork, index) {
            entry.queued = false;
            if fork == core.fork() && core.has(index) {
                entry.resolve_with(block_value(core, index));
                self.blocks.remove(fork, index);
                return;
            }
        }
        self.blocks.remove_if_idle(fork, index);
    }

    /// Count an invalid answer against peer `pi`. Returns whether the peer
    /// should be closed.
    fn penalize(&mut self, pi: usize, reason: &str) -> bool {
        metric_inc!(INVALID_RESPONSES, &[reason]);
        let peer = &mut self.peers[pi];
        peer.invalid_responses += 1;
        log_peer_event!(
            warn,
            peer.id,
            "invalid response",
            reason = reason,
            count = peer.invalid_responses
        );
        peer.invalid_responses >= self.config.max_invalid_responses
    }

    fn reject_response(&mut self, core: &Core, pi: usize, request: &Request, reason: &str) {
        let peer = self.peers[pi].id;
        if let Some(block) = request.request.block {
            self.peers[pi].remote_bitfield.set(block.index, false);
        }
        let close = self.penalize(pi, reason);
        self.detach_request(request);
        if close {
            self.close_peer(core, peer);
        } else {
            self.update_all(core);
        }
    }

    fn close_peer(&mut self, core: &Core, peer: PeerId) {
        log_peer_event!(warn, peer, "closing misbehaving peer");
        self.outbox.push_back((peer, PeerMessage::Close));
        self.remove_peer(core, peer);
    }

    fn check_availability(&mut self, core: &Core) {
        let fork = core.fork();
        let length = core.length();

        let peers = &self.peers;
        self.reorgs.retain(|attempt| {
            attempt.fork > fork
                && (!attempt.inflight.is_empty()
                    || attempt.finished()
                    || peers.iter().any(|p| {
                        p.can_reorg(fork)
                            && p.remote_fork == attempt.fork
                            && !attempt.refused.contains(&p.id)
                    }))
        });

        let pending = self.peers.iter().any(|p| {
            p.state == PeerState::Opening || (p.is_open() && !p.remote_signaled)
        });
        if pending {
            return;
        }

        let unavailable: Vec<u64> = self
            .blocks
            .iter()
            .filter(|b| b.fork == fork && b.inflight.is_empty() && !b.if_available.is_empty())
            .filter(|b| !self.peers.iter().any(|p| p.could_serve(b.index, fork, length)))
            .map(|b| b.index)
            .collect();
        for index in unavailable {
            if let Some(entry) = self.blocks.get_mut(fork, index) {
                entry
                    .if_available
                    .reject(ReplicationError::BlockNotAvailable(index));
            }
            if self.blocks.remove_if_idle(fork, index) {
                self.queued.retain(|&(f, i)| f != fork || i != index);
            }
        }

        if self.upgrade.is_some() {
            let waiting = self.upgrade_inflight(core)
                || !self.reorgs.is_empty()
                || self.peers.iter().any(|p| p.can_upgrade(fork, length));
            if !waiting {
                if let Some(mut want) = self.upgrade.take() {
                    debug!(length, fork, "no peer can upgrade");
                    want.listeners.resolve(false);
                }
            }
        }
    }

    // =========================================================================
    // Want bookkeeping
    // =========================================================================

    fn add_upgrade(&mut self, core: &Core) -> &mut UpgradeWant {
        self.upgrade.get_or_insert_with(|| UpgradeWant {
            fork: core.fork(),
            length: core.length(),
            listeners: Listeners::new(),
        })
    }

    /// Settle every want the local state now satisfies.
    fn refresh(&mut self, core: &Core) {
        self.resolve_local(core);
        self.update_seeks(core);
        self.update_ranges(core);
        self.resolve_upgrade(core);
    }

    fn resolve_local(&mut self, core: &Core) {
        let fork = core.fork();
        let local: Vec<u64> = self
            .blocks
            .iter()
            .filter(|b| b.fork == fork && core.has(b.index))
            .map(|b| b.index)
            .collect();
        for index in local {
            if let Some(mut entry) = self.blocks.remove(fork, index) {
                entry.resolve_with(block_value(core, index));
            }
        }
    }

    fn update_seeks(&mut self, core: &Core) {
        let fork = core.fork();
        let mut i = 0;
        while i < self.seeks.len() {
            let seek = &mut self.seeks[i];
            if seek.fork != fork {
                i += 1;
                continue;
            }
            let result = match core.update_seeker(&mut seek.seeker) {
                Ok(None) => {
                    i += 1;
                    continue;
                }
                Ok(Some(found)) => Ok(found),
                Err(err) => Err(ReplicationError::from(err)),
            };
            let mut done = self.seeks.swap_remove(i);
            match result {
                Ok(found) => done.listeners.resolve(found),
                Err(err) => done.listeners.reject(err),
            }
        }
    }

    fn update_ranges(&mut self, core: &Core) {
        let fork = core.fork();
        let mut i = 0;
        while i < self.ranges.len() {
            let range = &mut self.ranges[i];
            if range.fork == fork {
                let limit = range.end.unwrap_or(core.length());
                while range.cursor < limit && core.has(range.cursor) {
                    range.cursor += 1;
                }
                if range.end.is_some_and(|end| range.cursor >= end) {
                    let mut done = self.ranges.swap_remove(i);
                    debug!(id = done.id, "range complete");
                    done.listeners.resolve(());
                    continue;
                }
            }
            i += 1;
        }
    }

    fn resolve_upgrade(&mut self, core: &Core) {
        let changed = self
            .upgrade
            .as_ref()
            .is_some_and(|w| core.fork() != w.fork || core.length() > w.length);
        if changed {
            if let Some(mut want) = self.upgrade.take() {
                want.listeners.resolve(true);
            }
        }
    }

    /// Move wants onto the core's current fork.
    fn rebase(&mut self, core: &Core) {
        let fork = core.fork();
        self.blocks.update(fork);

        let stale: Vec<(u64, u64)> = self
            .blocks
            .iter()
            .filter(|b| b.fork != fork)
            .map(|b| (b.fork, b.index))
            .collect();
        for (old, index) in stale {
            let Some(mut entry) = self.blocks.remove(old, index) else {
                continue;
            };
            if !entry.has_listeners() {
                continue;
            }
            let moved = self.blocks.add(fork, index);
            moved.listeners.append(&mut entry.listeners);
            moved.if_available.append(&mut entry.if_available);
            if moved.inflight.is_empty() && !moved.queued {
                moved.queued = true;
                self.queued.push((fork, index));
            }
        }
        self.queued.retain(|&(f, _)| f == fork);

        for range in &mut self.ranges {
            range.fork = fork;
            range.cursor = range.start;
        }
        for seek in &mut self.seeks {
            seek.fork = fork;
            seek.inflight.clear();
            seek.seeker = core.seek(seek.seeker.bytes);
        }
    }

    fn broadcast(&mut self, except: Option<PeerId>, message: PeerMessage) {
        for peer in &self.peers {
            if peer.is_open() && Some(peer.id) != except {
                self.outbox.push_back((peer.id, message.clone()));
            }
        }
    }

    fn peer_index(&self, id: PeerId) -> Option<usize> {
        self.peers.iter().position(|p| p.id == id)
    }
}

fn block_value(core: &Core, index: u64) -> Result<BlockValue, ReplicationError> {
    core.get(index)?
        .ok_or(ReplicationError::BlockNotAvailable(index))
}

fn failure_reason(err: &CoreError) -> &'static str {
    match err {
        CoreError::InvalidSignature => "signature",
        _ => "proof",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omega_core::{CoreConfig, CoreStorage, Ed25519Authorization};
    use std::sync::Arc;

    struct Node {
        core: Core,
        replicator: Replicator,
    }

    impl Node {
        fn writer(blocks: &[&str]) -> Self {
            let mut core = Core::memory(CoreConfig::for_testing()).unwrap();
            let mut replicator = Replicator::new(ReplicationConfig::for_testing(), core.fork());
            if !blocks.is_empty() {
                core.append(blocks).unwrap();
                replicator.on_append(&core, 0);
            }
            Self { core, replicator }
        }

        fn reader_of(writer: &Node, config: ReplicationConfig) -> Self {
            let auth = Ed25519Authorization::from_public_key(writer.core.key()).unwrap();
            let core = Core::open(CoreStorage::memory(), Arc::new(auth), CoreConfig::for_testing())
                .unwrap();
            let replicator = Replicator::new(config, core.fork());
            Self { core, replicator }
        }

        fn append(&mut self, blocks: &[&str]) {
            let start = self.core.length();
            self.core.append(blocks).unwrap();
            self.replicator.on_append(&self.core, start);
        }

        fn truncate(&mut self, length: u64) {
            let previous = self.core.length();
            self.core.truncate(length).unwrap();
            self.replicator.on_truncate(&self.core, previous);
        }
    }

    /// `a_peer` is how `a` sees `b`, and the other way round.
    struct Link {
        a_peer: PeerId,
        b_peer: PeerId,
    }

    fn connect(a: &mut Node, b: &mut Node) -> Link {
        let a_peer = a.replicator.add_peer();
        let b_peer = b.replicator.add_peer();
        a.replicator.on_remote_open(&a.core, a_peer);
        b.replicator.on_remote_open(&b.core, b_peer);
        Link { a_peer, b_peer }
    }

    fn pump(a: &mut Node, b: &mut Node, link: &Link) {
        for _ in 0..10_000 {
            let from_a = a.replicator.drain_outbox();
            let from_b = b.replicator.drain_outbox();
            if from_a.is_empty() && from_b.is_empty() {
                return;
            }
            for (peer, message) in from_a {
                if peer == link.a_peer {
                    b.replicator.on_message(&mut b.core, link.b_peer, message);
                }
            }
            for (peer, message) in from_b {
                if peer == link.b_peer {
                    a.replicator.on_message(&mut a.core, link.a_peer, message);
                }
            }
        }
        panic!("replication did not settle");
    }

    fn requests(outbox: &[(PeerId, PeerMessage)]) -> Vec<(PeerId, u64, ProofRequest)> {
        outbox
            .iter()
            .filter_map(|(peer, message)| match message {
                PeerMessage::Request { id, request } => Some((*peer, *id, request.clone())),
                _ => None,
            })
            .collect()
    }

    const BLOCKS: [&str; 5] = ["a", "b", "c", "d", "e"];

    #[test]
    fn test_range_download() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);

        let (_, mut done) = reader.replicator.add_range(&reader.core, 0, Some(5), false);
        pump(&mut writer, &mut reader, &link);

        assert_eq!(done.try_recv().unwrap(), Ok(()));
        assert_eq!(reader.core.length(), 5);
        for (i, block) in BLOCKS.iter().enumerate() {
            assert!(reader.core.has(i as u64));
            assert_eq!(reader.core.get(i as u64).unwrap().unwrap(), block.as_bytes());
        }
        assert_eq!(reader.replicator.inflight_len(), 0);

        let events = reader.replicator.drain_events();
        assert!(events.contains(&CoreEvent::Append { length: 5 }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, CoreEvent::Download { .. }))
                .count(),
            5
        );
        let uploads = writer.replicator.drain_events();
        assert!(uploads.contains(&CoreEvent::Upload { index: 4 }));
    }

    #[test]
    fn test_concurrent_gets_share_one_request() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(reader.core.length(), 5);

        let mut first = reader.replicator.request_block(&reader.core, 3, false);
        let mut second = reader.replicator.request_block(&reader.core, 3, false);

        let outbox = reader.replicator.drain_outbox();
        let sent = requests(&outbox);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2.block.map(|b| b.index), Some(3));
        assert_eq!(reader.replicator.inflight_len(), 1);

        for (_, message) in outbox {
            writer
                .replicator
                .on_message(&mut writer.core, link.a_peer, message);
        }
        pump(&mut writer, &mut reader, &link);

        assert_eq!(first.try_recv().unwrap(), Ok(b"d".to_vec()));
        assert_eq!(second.try_recv().unwrap(), Ok(b"d".to_vec()));
    }

    #[test]
    fn test_local_block_resolves_immediately() {
        let mut writer = Node::writer(&BLOCKS);
        let mut waiter = writer.replicator.request_block(&writer.core, 1, false);
        assert_eq!(waiter.try_recv().unwrap(), Ok(b"b".to_vec()));
        assert!(writer.replicator.drain_outbox().is_empty());
    }

    #[test]
    fn test_block_past_length_carries_upgrade() {
        let mut writer = Node::writer(&BLOCKS);
        let config = ReplicationConfig::for_testing().with_eager_upgrade(false);
        let mut reader = Node::reader_of(&writer, config);
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(reader.core.length(), 0);

        let mut waiter = reader.replicator.request_block(&reader.core, 4, false);
        let sent = requests(&reader.replicator.drain_outbox());
        assert_eq!(sent.len(), 1);
        let upgrade = sent[0].2.upgrade.expect("upgrade piggybacked");
        assert_eq!((upgrade.start, upgrade.length), (0, 5));

        let request = PeerMessage::Request {
            id: sent[0].1,
            request: sent[0].2.clone(),
        };
        writer
            .replicator
            .on_message(&mut writer.core, link.a_peer, request);
        pump(&mut writer, &mut reader, &link);

        assert_eq!(waiter.try_recv().unwrap(), Ok(b"e".to_vec()));
        assert_eq!(reader.core.length(), 5);
    }

    #[test]
    fn test_update_resolves_true_after_upgrade() {
        let mut writer = Node::writer(&BLOCKS);
        let config = ReplicationConfig::for_testing().with_eager_upgrade(false);
        let mut reader = Node::reader_of(&writer, config);
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        let mut updated = reader.replicator.request_upgrade(&mut reader.core);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(updated.try_recv().unwrap(), Ok(true));
        assert_eq!(reader.core.length(), 5);

        let mut again = reader.replicator.request_upgrade(&mut reader.core);
        assert_eq!(again.try_recv().unwrap(), Ok(false));
    }

    #[test]
    fn test_without_peers_nothing_is_available() {
        let writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());

        let mut updated = reader.replicator.request_upgrade(&mut reader.core);
        assert_eq!(updated.try_recv().unwrap(), Ok(false));

        let mut block = reader.replicator.request_block(&reader.core, 0, true);
        assert_eq!(
            block.try_recv().unwrap(),
            Err(ReplicationError::BlockNotAvailable(0))
        );
        assert_eq!(reader.replicator.queued_len(), 0);
    }

    #[test]
    fn test_writer_eventually_serves_waiting_get() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        let mut waiter = reader.replicator.request_block(&reader.core, 6, false);
        pump(&mut writer, &mut reader, &link);
        assert!(waiter.try_recv().is_err());
        assert_eq!(reader.replicator.queued_len(), 1);

        writer.append(&["f", "g"]);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(waiter.try_recv().unwrap(), Ok(b"g".to_vec()));
    }

    #[test]
    fn test_disconnect_requeues_block() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        let mut waiter = reader.replicator.request_block(&reader.core, 2, false);
        assert_eq!(reader.replicator.inflight_len(), 1);
        reader.replicator.drain_outbox();

        let departed = reader.replicator.remove_peer(&reader.core, link.b_peer).unwrap();
        assert_eq!(departed.state, PeerState::Closed);
        assert!(reader.replicator.peer(link.b_peer).is_none());
        assert!(reader.replicator.remove_peer(&reader.core, link.b_peer).is_none());
        assert_eq!(reader.replicator.inflight_len(), 0);
        assert_eq!(reader.replicator.queued_len(), 1);
        assert!(reader
            .replicator
            .drain_events()
            .contains(&CoreEvent::PeerRemove { peer: link.b_peer }));

        writer.replicator.remove_peer(&writer.core, link.a_peer);
        let relink = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &relink);
        assert_eq!(waiter.try_recv().unwrap(), Ok(b"c".to_vec()));
    }

    #[test]
    fn test_no_data_moves_want_to_other_peer() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        // A second peer that claims every block but never delivers.
        let liar = reader.replicator.add_peer();
        reader.replicator.on_remote_open(&reader.core, liar);
        let claims = [
            PeerMessage::Have { start: 0, length: 5 },
            PeerMessage::Info { length: 5, fork: 0 },
        ];
        for message in claims {
            reader
                .replicator
                .on_message(&mut reader.core, liar, message);
        }
        reader.replicator.drain_outbox();

        let mut waiter = reader.replicator.request_block(&reader.core, 1, false);
        for _ in 0..4 {
            let outbox = reader.replicator.drain_outbox();
            let to_liar = requests(&outbox)
                .into_iter()
                .find(|(peer, _, _)| *peer == liar);
            for (peer, message) in outbox {
                if peer == link.b_peer {
                    writer
                        .replicator
                        .on_message(&mut writer.core, link.a_peer, message);
                }
            }
            if let Some((_, id, _)) = to_liar {
                reader
                    .replicator
                    .on_message(&mut reader.core, liar, PeerMessage::NoData { request: id });
                assert!(!reader.replicator.peer(liar).unwrap().remote_bitfield.get(1));
            }
            pump(&mut writer, &mut reader, &link);
        }

        assert_eq!(waiter.try_recv().unwrap(), Ok(b"b".to_vec()));
    }

    #[test]
    fn test_invalid_proofs_close_peer() {
        let mut writer = Node::writer(&BLOCKS);
        let mut config = ReplicationConfig::for_testing();
        config.max_invalid_responses = 1;
        let mut reader = Node::reader_of(&writer, config);
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        let _waiter = reader.replicator.request_block(&reader.core, 0, false);
        let sent = requests(&reader.replicator.drain_outbox());
        assert_eq!(sent.len(), 1);
        let (_, id, request) = sent[0].clone();

        let mut proof = writer.core.proof(&request).unwrap();
        proof.block.as_mut().unwrap().value = b"forged".to_vec();
        reader.replicator.on_message(
            &mut reader.core,
            link.b_peer,
            PeerMessage::Data { request: id, proof },
        );

        assert!(!reader.core.has(0));
        assert!(reader.replicator.peer(link.b_peer).is_none());
        assert!(reader
            .replicator
            .drain_outbox()
            .contains(&(link.b_peer, PeerMessage::Close)));
        assert_eq!(reader.replicator.queued_len(), 1);
    }

    #[test]
    fn test_reorg_to_writer_fork() {
        let mut writer = Node::writer(&BLOCKS);
        writer.truncate(5);
        assert_eq!(writer.core.fork(), 1);

        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        let (_, mut done) = reader.replicator.add_range(&reader.core, 0, Some(5), true);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(done.try_recv().unwrap(), Ok(()));
        assert_eq!((reader.core.fork(), reader.core.length()), (1, 5));
        reader.replicator.drain_events();

        writer.truncate(3);
        writer.append(&["x", "y"]);
        pump(&mut writer, &mut reader, &link);

        assert_eq!(reader.core.fork(), 2);
        assert_eq!(reader.core.length(), 5);
        assert!(reader.core.has(2));
        assert!(!reader.core.has(3));
        assert!(!reader.core.has(4));
        assert!(reader
            .replicator
            .drain_events()
            .contains(&CoreEvent::Reorg { fork: 2, ancestors: 3 }));

        let mut block = reader.replicator.request_block(&reader.core, 4, false);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(block.try_recv().unwrap(), Ok(b"y".to_vec()));
    }

    #[test]
    fn test_forged_fork_is_rejected() {
        let writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());

        // Same blocks under a different key, forked ahead of the reader.
        let mut impostor = Node::writer(&BLOCKS);
        impostor.truncate(5);
        let proof = impostor
            .core
            .proof(&ProofRequest::upgrade(1, 0, 5))
            .unwrap();

        let peer = reader.replicator.add_peer();
        reader.replicator.on_remote_open(&reader.core, peer);
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Info { length: 5, fork: 1 },
        );
        reader.replicator.drain_outbox();
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Data { request: 99, proof },
        );

        assert_eq!((reader.core.fork(), reader.core.length()), (0, 0));
        assert_eq!(reader.replicator.peer(peer).unwrap().invalid_responses, 1);
        assert!(!reader
            .replicator
            .drain_events()
            .iter()
            .any(|e| matches!(e, CoreEvent::Reorg { .. })));
    }

    #[test]
    fn test_answer_from_a_newer_fork_starts_a_reorg() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(reader.core.length(), 5);

        let mut block = reader.replicator.request_block(&reader.core, 0, false);
        let sent = requests(&reader.replicator.drain_outbox());
        assert_eq!(sent.len(), 1);
        let (_, id, request) = sent[0].clone();
        assert_eq!(request.fork, 0);

        // The writer forks while the request is on the wire and answers
        // from its new fork.
        writer.truncate(5);
        let proof = writer
            .core
            .proof(&ProofRequest::upgrade(1, 0, 5))
            .unwrap();
        reader.replicator.on_message(
            &mut reader.core,
            link.b_peer,
            PeerMessage::Data { request: id, proof },
        );
        assert_eq!(reader.replicator.peer(link.b_peer).unwrap().invalid_responses, 0);

        pump(&mut writer, &mut reader, &link);
        assert_eq!((reader.core.fork(), reader.core.length()), (1, 5));
        assert_eq!(block.try_recv().unwrap(), Ok(b"a".to_vec()));
        assert!(reader.replicator.peer(link.b_peer).is_some());
    }

    #[test]
    fn test_huge_claims_from_a_peer_are_cheap() {
        let writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let peer = reader.replicator.add_peer();
        reader.replicator.on_remote_open(&reader.core, peer);

        let started = std::time::Instant::now();
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Info { length: 1 << 30, fork: 0 },
        );
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Have { start: 0, length: 1 << 28 },
        );
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Range { start: 3, length: u64::MAX, drop: false },
        );
        reader.replicator.on_message(
            &mut reader.core,
            peer,
            PeerMessage::Info { length: 0, fork: 0 },
        );
        assert!(started.elapsed() < std::time::Duration::from_secs(1));

        let remote = reader.replicator.peer(peer).unwrap();
        assert_eq!(remote.remote_length, 0);
        assert!(!remote.remote_bitfield.any(0, 1 << 30));

        let removed = reader.replicator.remove_peer(&reader.core, peer).unwrap();
        assert!(!removed.is_open());
        assert_eq!(removed.state, PeerState::Closed);
    }

    // =============================================================================
    // EXTENSIONS / CLEAR / STATS
    // =============================================================================

    #[test]
    fn test_extension_messages_reach_registered_peers_only() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        reader.replicator.drain_events();

        writer.replicator.register_extension("acks");
        writer
            .replicator
            .send_extension(None, "acks", b"before".to_vec())
            .unwrap();
        pump(&mut writer, &mut reader, &link);
        assert!(!reader
            .replicator
            .drain_events()
            .iter()
            .any(|e| matches!(e, CoreEvent::Extension { .. })));

        reader.replicator.register_extension("acks");
        writer
            .replicator
            .send_extension(Some(link.a_peer), "acks", b"after".to_vec())
            .unwrap();
        pump(&mut writer, &mut reader, &link);
        assert!(reader.replicator.drain_events().contains(&CoreEvent::Extension {
            peer: link.b_peer,
            name: "acks".to_string(),
            payload: b"after".to_vec(),
        }));

        assert_eq!(
            writer
                .replicator
                .send_extension(Some(PeerId(404)), "acks", Vec::new()),
            Err(ReplicationError::Disconnected)
        );
    }

    #[test]
    fn test_cleared_blocks_are_dropped_from_peer_views() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        assert!(reader.replicator.peer(link.b_peer).unwrap().remote_bitfield.get(3));

        assert_eq!(writer.core.clear(1, 4).unwrap(), 3);
        writer.replicator.on_clear(&writer.core, 1, 4);
        pump(&mut writer, &mut reader, &link);

        let view = &reader.replicator.peer(link.b_peer).unwrap().remote_bitfield;
        assert!(view.get(0));
        assert!(!view.any(1, 4));
        assert!(view.get(4));

        let mut missing = reader.replicator.request_block(&reader.core, 2, true);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(missing.try_recv().unwrap(), Err(ReplicationError::BlockNotAvailable(2)));
    }

    #[test]
    fn test_transfer_counters() {
        let mut writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);

        let (_, mut done) = reader.replicator.add_range(&reader.core, 0, Some(3), false);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(done.try_recv().unwrap(), Ok(()));

        let stats = reader.replicator.stats();
        assert_eq!(stats.downloaded_blocks, 3);
        assert_eq!(stats.uploaded_blocks, 0);
        assert_eq!(stats.open_peers, 1);
        assert_eq!(stats.inflight_requests, 0);
        assert_eq!(writer.replicator.stats().uploaded_blocks, 3);
    }

    #[test]
    fn test_destroyed_range_is_cancelled() {
        let writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());

        let (id, mut done) = reader.replicator.add_range(&reader.core, 0, Some(5), false);
        assert!(reader.replicator.destroy_range(id));
        assert!(!reader.replicator.destroy_range(id));
        assert_eq!(
            done.try_recv().unwrap(),
            Err(ReplicationError::RequestCancelled)
        );
    }

    #[test]
    fn test_seek_over_the_wire() {
        let mut writer = Node::writer(&["aa", "bbb", "c"]);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);

        let mut found = reader.replicator.request_seek(&reader.core, 4);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(found.try_recv().unwrap(), Ok((1, 2)));
    }

    #[test]
    fn test_seek_against_a_longer_peer() {
        let mut writer = Node::writer(&["aa", "bbb", "c"]);
        let config = ReplicationConfig::for_testing().with_eager_upgrade(false);
        let mut reader = Node::reader_of(&writer, config);
        let link = connect(&mut writer, &mut reader);
        pump(&mut writer, &mut reader, &link);
        let mut updated = reader.replicator.request_upgrade(&mut reader.core);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(updated.try_recv().unwrap(), Ok(true));

        // The writer moves on; its seek path now ends at a root the reader
        // has never seen.
        writer.append(&["dddd", "e"]);
        pump(&mut writer, &mut reader, &link);
        assert_eq!(reader.core.length(), 3);

        let mut found = reader.replicator.request_seek(&reader.core, 4);
        let sent = requests(&reader.replicator.outbox.iter().cloned().collect::<Vec<_>>());
        assert!(sent.iter().all(|(_, _, r)| r.seek.is_none() || r.upgrade.is_some()));
        pump(&mut writer, &mut reader, &link);
        assert_eq!(found.try_recv().unwrap(), Ok((1, 2)));
        assert_eq!(reader.core.length(), 5);
        assert!(reader.replicator.peers()[0].is_open());
    }

    #[test]
    fn test_close_rejects_waiters() {
        let writer = Node::writer(&BLOCKS);
        let mut reader = Node::reader_of(&writer, ReplicationConfig::for_testing());
        let peer = reader.replicator.add_peer();

        let mut block = reader.replicator.request_block(&reader.core, 0, false);
        reader.replicator.close();
        assert_eq!(block.try_recv().unwrap(), Err(ReplicationError::SessionClosed));
        assert!(reader.replicator.peer(peer).is_none());

        let mut late = reader.replicator.request_block(&reader.core, 0, false);
        assert_eq!(late.try_recv().unwrap(), Err(ReplicationError::SessionClosed));
    }
}
