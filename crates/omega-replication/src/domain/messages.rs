//! Wire messages.
//!
//! [`Message`] is what travels on a connection. Channel-scoped variants carry
//! the sender's local channel alias for the core; `Open`, `Close` and `Info`
//! name the core by discovery key instead. [`PeerMessage`] is the same
//! traffic with the addressing stripped, as seen by the scheduler.

use omega_core::{Hash, Proof, ProofRequest};
use serde::{Deserialize, Serialize};

/// A message on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Start talking about a core, proving knowledge of its key.
    Open {
        /// Sender's alias for the core on this connection.
        channel: u32,
        /// Discovery key of the core.
        discovery_key: Hash,
        /// Per-connection capability.
        capability: Hash,
    },
    /// Stop talking about a core.
    Close {
        /// Discovery key of the core.
        discovery_key: Hash,
    },
    /// Length and fork announcement.
    Info {
        /// Discovery key of the core.
        discovery_key: Hash,
        /// Sender's length.
        length: u64,
        /// Sender's fork.
        fork: u64,
    },
    /// The sender now has `[start, start + length)`.
    Have {
        /// Sender's channel alias.
        channel: u32,
        /// First block.
        start: u64,
        /// Number of blocks.
        length: u64,
    },
    /// One page of the sender's bitfield.
    Bitfield {
        /// Sender's channel alias.
        channel: u32,
        /// First block covered by the page.
        start: u64,
        /// Page words.
        page: Vec<u32>,
    },
    /// Ask for a proof.
    Request {
        /// Sender's channel alias.
        channel: u32,
        /// Request id, echoed in the answer.
        id: u64,
        /// What is asked for.
        request: ProofRequest,
    },
    /// Proof answering a request.
    Data {
        /// Sender's channel alias.
        channel: u32,
        /// Id of the request answered.
        request: u64,
        /// The proof.
        proof: Proof,
    },
    /// The request cannot be answered.
    NoData {
        /// Sender's channel alias.
        channel: u32,
        /// Id of the request refused.
        request: u64,
    },
    /// Presence delta over a range.
    Range {
        /// Sender's channel alias.
        channel: u32,
        /// First block.
        start: u64,
        /// Number of blocks.
        length: u64,
        /// Whether the range was dropped rather than gained.
        drop: bool,
    },
    /// Application message for a named extension.
    Extension {
        /// Sender's channel alias.
        channel: u32,
        /// Extension name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
}

impl Message {
    /// Channel alias of a scoped message.
    pub fn channel(&self) -> Option<u32> {
        match self {
            Message::Open { .. } | Message::Close { .. } | Message::Info { .. } => None,
            Message::Have { channel, .. }
            | Message::Bitfield { channel, .. }
            | Message::Request { channel, .. }
            | Message::Data { channel, .. }
            | Message::NoData { channel, .. }
            | Message::Range { channel, .. }
            | Message::Extension { channel, .. } => Some(*channel),
        }
    }

    /// Address a peer message for the wire.
    pub fn scoped(channel: u32, discovery_key: Hash, message: PeerMessage) -> Self {
        match message {
            PeerMessage::Info { length, fork } => Message::Info {
                discovery_key,
                length,
                fork,
            },
            PeerMessage::Close => Message::Close { discovery_key },
            PeerMessage::Have { start, length } => Message::Have {
                channel,
                start,
                length,
            },
            PeerMessage::Bitfield { start, page } => Message::Bitfield {
                channel,
                start,
                page,
            },
            PeerMessage::Request { id, request } => Message::Request {
                channel,
                id,
                request,
            },
            PeerMessage::Data { request, proof } => Message::Data {
                channel,
                request,
                proof,
            },
            PeerMessage::NoData { request } => Message::NoData { channel, request },
            PeerMessage::Range {
                start,
                length,
                drop,
            } => Message::Range {
                channel,
                start,
                length,
                drop,
            },
            PeerMessage::Extension { name, payload } => Message::Extension {
                channel,
                name,
                payload,
            },
        }
    }

    /// Strip the addressing. `Open` has no peer-level form.
    pub fn into_peer_message(self) -> Option<PeerMessage> {
        Some(match self {
            Message::Open { .. } => return None,
            Message::Close { .. } => PeerMessage::Close,
            Message::Info { length, fork, .. } => PeerMessage::Info { length, fork },
            Message::Have { start, length, .. } => PeerMessage::Have { start, length },
            Message::Bitfield { start, page, .. } => PeerMessage::Bitfield { start, page },
            Message::Request { id, request, .. } => PeerMessage::Request { id, request },
            Message::Data { request, proof, .. } => PeerMessage::Data { request, proof },
            Message::NoData { request, .. } => PeerMessage::NoData { request },
            Message::Range {
                start,
                length,
                drop,
                ..
            } => PeerMessage::Range {
                start,
                length,
                drop,
            },
            Message::Extension { name, payload, .. } => PeerMessage::Extension { name, payload },
        })
    }
}

/// A message between the scheduler and one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    /// Length and fork announcement.
    Info {
        /// Length in blocks.
        length: u64,
        /// Fork id.
        fork: u64,
    },
    /// Presence gained over a range.
    Have {
        /// First block.
        start: u64,
        /// Number of blocks.
        length: u64,
    },
    /// One bitfield page.
    Bitfield {
        /// First block covered by the page.
        start: u64,
        /// Page words.
        page: Vec<u32>,
    },
    /// Proof request.
    Request {
        /// Request id.
        id: u64,
        /// What is asked for.
        request: ProofRequest,
    },
    /// Proof answer.
    Data {
        /// Id of the request answered.
        request: u64,
        /// The proof.
        proof: Proof,
    },
    /// Refusal.
    NoData {
        /// Id of the request refused.
        request: u64,
    },
    /// Presence delta.
    Range {
        /// First block.
        start: u64,
        /// Number of blocks.
        length: u64,
        /// Whether the range was dropped.
        drop: bool,
    },
    /// Extension message.
    Extension {
        /// Extension name.
        name: String,
        /// Opaque payload.
        payload: Vec<u8>,
    },
    /// The channel is being closed.
    Close,
}
