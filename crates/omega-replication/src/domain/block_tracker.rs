//! One entry per `(fork, index)` the scheduler is working on.
//!
//! Entries on the current fork sit in a map; entries on any other fork are
//! kept in a short list that is scanned linearly. A fork switch reclassifies
//! them.

use std::collections::HashMap;

use crate::domain::errors::ReplicationError;
use crate::domain::listeners::{Listeners, Waiter};

/// Value delivered to block waiters.
pub type BlockValue = Vec<u8>;

/// Work and waiters for one block.
#[derive(Debug)]
pub struct BlockEntry {
    /// Fork the block is wanted at.
    pub fork: u64,
    /// Block index.
    pub index: u64,
    /// Ids of requests carrying this block.
    pub inflight: Vec<u64>,
    /// Whether the entry sits in the scheduler's queue.
    pub queued: bool,
    /// Callers that wait until a peer delivers.
    pub listeners: Listeners<BlockValue>,
    /// Callers that give up once no peer claims the block.
    pub if_available: Listeners<BlockValue>,
}

impl BlockEntry {
    fn new(fork: u64, index: u64) -> Self {
        Self {
            fork,
            index,
            inflight: Vec::new(),
            queued: false,
            listeners: Listeners::new(),
            if_available: Listeners::new(),
        }
    }

    /// Add a caller.
    pub fn attach(&mut self, if_available: bool) -> Waiter<BlockValue> {
        if if_available {
            self.if_available.attach()
        } else {
            self.listeners.attach()
        }
    }

    /// Whether any caller still waits.
    pub fn has_listeners(&self) -> bool {
        !self.listeners.is_empty() || !self.if_available.is_empty()
    }

    /// Forget request `id`. Returns whether it was attached here.
    pub fn detach(&mut self, id: u64) -> bool {
        match self.inflight.iter().position(|r| *r == id) {
            Some(pos) => {
                self.inflight.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Complete every caller with `value`.
    pub fn resolve(&mut self, value: BlockValue) {
        self.if_available.resolve(value.clone());
        self.listeners.resolve(value);
    }

    /// Complete every caller with `err`.
    pub fn reject(&mut self, err: ReplicationError) {
        self.if_available.reject(err.clone());
        self.listeners.reject(err);
    }

    /// Complete every caller with a local read.
    pub fn resolve_with(&mut self, result: Result<BlockValue, ReplicationError>) {
        match result {
            Ok(value) => self.resolve(value),
            Err(err) => self.reject(err),
        }
    }
}

/// Entries keyed by `(fork, index)`.
#[derive(Debug)]
pub struct BlockTracker {
    fork: u64,
    indexed: HashMap<u64, BlockEntry>,
    additional: Vec<BlockEntry>,
}

impl BlockTracker {
    /// Empty tracker indexing fork `fork`.
    pub fn new(fork: u64) -> Self {
        Self {
            fork,
            indexed: HashMap::new(),
            additional: Vec::new(),
        }
    }

    /// Fork whose entries are indexed.
    pub fn fork(&self) -> u64 {
        self.fork
    }

    /// Entry for `(fork, index)`.
    pub fn get(&self, fork: u64, index: u64) -> Option<&BlockEntry> {
        if fork == self.fork {
            return self.indexed.get(&index);
        }
        self.additional
            .iter()
            .find(|b| b.fork == fork && b.index == index)
    }

    /// Mutable entry for `(fork, index)`.
    pub fn get_mut(&mut self, fork: u64, index: u64) -> Option<&mut BlockEntry> {
        if fork == self.fork {
            return self.indexed.get_mut(&index);
        }
        self.additional
            .iter_mut()
            .find(|b| b.fork == fork && b.index == index)
    }

    /// Entry for `(fork, index)`, created if absent.
    pub fn add(&mut self, fork: u64, index: u64) -> &mut BlockEntry {
        if fork == self.fork {
            return self
                .indexed
                .entry(index)
                .or_insert_with(|| BlockEntry::new(fork, index));
        }

        let pos = match self
            .additional
            .iter()
            .position(|b| b.fork == fork && b.index == index)
        {
            Some(pos) => pos,
            None => {
                self.additional.push(BlockEntry::new(fork, index));
                self.additional.len() - 1
            }
        };
        &mut self.additional[pos]
    }

    /// Take the entry for `(fork, index)` out of the tracker.
    ///
    /// Requests still listed in its `inflight` are detached with it.
    pub fn remove(&mut self, fork: u64, index: u64) -> Option<BlockEntry> {
        if fork == self.fork {
            return self.indexed.remove(&index);
        }
        let pos = self
            .additional
            .iter()
            .position(|b| b.fork == fork && b.index == index)?;
        Some(self.additional.swap_remove(pos))
    }

    /// Remove the entry if nothing is in flight and nobody waits on it.
    pub fn remove_if_idle(&mut self, fork: u64, index: u64) -> bool {
        let idle = self
            .get(fork, index)
            .is_some_and(|b| b.inflight.is_empty() && !b.has_listeners());
        if idle {
            self.remove(fork, index);
        }
        idle
    }

    /// Index entries of `fork` instead of the current one.
    pub fn update(&mut self, fork: u64) {
        if fork == self.fork {
            return;
        }

        let additional = std::mem::take(&mut self.additional);
        self.additional
            .extend(self.indexed.drain().map(|(_, entry)| entry));

        for entry in additional {
            if entry.fork == fork {
                self.indexed.insert(entry.index, entry);
            } else {
                self.additional.push(entry);
            }
        }
        self.fork = fork;
    }

    /// Every entry.
    pub fn iter(&self) -> impl Iterator<Item = &BlockEntry> {
        self.indexed.values().chain(self.additional.iter())
    }

    /// Every entry, mutably.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut BlockEntry> {
        self.indexed.values_mut().chain(self.additional.iter_mut())
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.indexed.len() + self.additional.len()
    }

    /// Whether the tracker is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
