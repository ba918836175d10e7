//! Channel multiplexer for one connection.
//!
//! Each side numbers the cores it talks about with its own small aliases and
//! announces them in `open`. Scoped messages carry the sender's alias, so
//! inbound routing goes through the remote alias table and outbound
//! addressing through the local one.

use std::collections::HashMap;

use omega_core::Hash;
use tracing::{debug, trace};

use crate::domain::messages::{Message, PeerMessage};

/// What an inbound message means for the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxEvent {
    /// The remote opened a channel for one of our cores.
    RemoteOpen {
        /// Core the channel is about.
        discovery_key: Hash,
        /// Capability the remote presented.
        capability: Hash,
    },
    /// The remote closed a channel.
    RemoteClose {
        /// Core the channel was about.
        discovery_key: Hash,
    },
    /// A message for one of our open channels.
    Message {
        /// Core the message is about.
        discovery_key: Hash,
        /// The message, addressing stripped.
        message: PeerMessage,
    },
    /// Something to send straight back.
    Reply(Message),
}

/// Alias tables of one connection.
#[derive(Debug, Default)]
pub struct Multiplexer {
    local: HashMap<Hash, u32>,
    remote: HashMap<u32, Hash>,
    next_alias: u32,
}

impl Multiplexer {
    /// Connection with no channels.
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an alias for `discovery_key` and build the `open` for it.
    pub fn open_channel(&mut self, discovery_key: Hash, capability: Hash) -> Message {
        let channel = match self.local.get(&discovery_key) {
            Some(alias) => *alias,
            None => {
                let alias = self.next_alias;
                self.next_alias += 1;
                self.local.insert(discovery_key, alias);
                alias
            }
        };
        Message::Open {
            channel,
            discovery_key,
            capability,
        }
    }

    /// Whether we opened a channel for `discovery_key`.
    pub fn is_local(&self, discovery_key: &Hash) -> bool {
        self.local.contains_key(discovery_key)
    }

    /// Whether the remote opened a channel for `discovery_key`.
    pub fn is_remote_open(&self, discovery_key: &Hash) -> bool {
        self.remote.values().any(|dk| dk == discovery_key)
    }

    /// Route one inbound message.
    pub fn incoming(&mut self, message: Message) -> Option<MuxEvent> {
        match message {
            Message::Open {
                channel,
                discovery_key,
                capability,
            } => {
                if !self.is_local(&discovery_key) {
                    debug!(channel, "open for unknown core, closing");
                    return Some(MuxEvent::Reply(Message::Close { discovery_key }));
                }
                self.remote.insert(channel, discovery_key);
                Some(MuxEvent::RemoteOpen {
                    discovery_key,
                    capability,
                })
            }
            Message::Close { discovery_key } => {
                let before = self.remote.len();
                self.remote.retain(|_, dk| *dk != discovery_key);
                let known = self.local.remove(&discovery_key).is_some();
                (known || before != self.remote.len())
                    .then_some(MuxEvent::RemoteClose { discovery_key })
            }
            Message::Info {
                discovery_key,
                length,
                fork,
            } => self.is_local(&discovery_key).then_some(MuxEvent::Message {
                discovery_key,
                message: PeerMessage::Info { length, fork },
            }),
            scoped => {
                let channel = scoped.channel()?;
                let Some(discovery_key) = self.remote.get(&channel).copied() else {
                    trace!(channel, "message on unknown channel");
                    return None;
                };
                let message = scoped.into_peer_message()?;
                Some(MuxEvent::Message {
                    discovery_key,
                    message,
                })
            }
        }
    }

    /// Address an outbound message. `None` if we have no channel for the
    /// core.
    pub fn outgoing(&mut self, discovery_key: Hash, message: PeerMessage) -> Option<Message> {
        let channel = *self.local.get(&discovery_key)?;
        if message == PeerMessage::Close {
            self.local.remove(&discovery_key);
            self.remote.retain(|_, dk| *dk != discovery_key);
        }
        Some(Message::scoped(channel, discovery_key, message))
    }

    /// Forget every channel. Returns the cores that were open locally.
    pub fn close_all(&mut self) -> Vec<Hash> {
        self.remote.clear();
        self.local.drain().map(|(dk, _)| dk).collect()
    }
}
