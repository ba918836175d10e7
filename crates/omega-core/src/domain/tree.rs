//! # Merkle Tree
//!
//! The append-only binary hash tree behind a core. Owns the trusted state
//! (roots, length, byte length, fork, signature), builds proofs for remote
//! readers and verifies proofs coming back from remote writers.
//!
//! All mutation goes through a [`MerkleTreeBatch`]: stage, sign, then
//! [`MerkleTree::commit`]. Committed nodes are held in memory until
//! [`MerkleTree::flush`] writes them to storage.
//!
//! ## Trust
//!
//! A node is trusted when it is stored locally and lies entirely below the
//! current length, or when it was produced by a signed upgrade in the same
//! batch. Verification hashes a proof path bottom-up through every supplied
//! sibling. Each trusted node it passes must match, and the last node it
//! reaches must be trusted, so a proof with missing, misplaced or surplus
//! siblings fails.

use crate::domain::batch::MerkleTreeBatch;
use crate::domain::errors::{CoreError, Hash};
use crate::domain::flat_tree;
use crate::domain::node::{total_size, Node, NODE_SIZE};
use crate::domain::proof::{DataBlock, DataHash, DataSeek, DataUpgrade, Proof, ProofRequest};
use crate::domain::seek::Locate;
use crate::ports::outbound::{Authorization, RandomAccess};
use omega_crypto::hash_roots;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

/// The append-only Merkle tree of a single core.
pub struct MerkleTree {
    storage: Box<dyn RandomAccess>,
    roots: Vec<Node>,
    length: u64,
    byte_length: u64,
    fork: u64,
    signature: Option<Vec<u8>>,
    unflushed: BTreeMap<u64, Node>,
    /// Flat index from which stored records are discarded on the next flush.
    truncated_to: Option<u64>,
    /// Stored ancestors that straddle a truncation point.
    stale: BTreeSet<u64>,
}

impl MerkleTree {
    /// Load a tree of `length` blocks from `storage`.
    ///
    /// Fails with [`CoreError::MissingNode`] if a root is not stored.
    pub fn open(
        storage: Box<dyn RandomAccess>,
        length: u64,
        fork: u64,
        signature: Option<Vec<u8>>,
    ) -> Result<Self, CoreError> {
        let mut tree = Self {
            storage,
            roots: Vec::new(),
            length: 0,
            byte_length: 0,
            fork,
            signature,
            unflushed: BTreeMap::new(),
            truncated_to: None,
            stale: BTreeSet::new(),
        };

        let mut roots = Vec::new();
        for index in flat_tree::full_roots(2 * length) {
            roots.push(tree.require_node(index)?);
        }
        tree.byte_length = total_size(&roots)
            .ok_or_else(|| CoreError::Storage("stored root sizes overflow".to_string()))?;
        tree.roots = roots;
        tree.length = length;

        debug!(length, fork, "opened merkle tree");
        Ok(tree)
    }

    /// Length in blocks.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Length in bytes.
    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Current fork id.
    pub fn fork(&self) -> u64 {
        self.fork
    }

    /// Current roots, left to right.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    /// Signature over the current state, if any.
    pub fn signature(&self) -> Option<&[u8]> {
        self.signature.as_deref()
    }

    /// Root digest.
    pub fn hash(&self) -> Hash {
        hash_roots(&self.roots)
    }

    /// Bytes the authorization policy signs for the current state.
    pub fn signable(&self, auth: &dyn Authorization) -> Vec<u8> {
        auth.signable(&self.hash(), self.length, self.fork)
    }

    /// Look up a node, committed or stored.
    pub fn get_node(&self, index: u64) -> Result<Option<Node>, CoreError> {
        if let Some(node) = self.unflushed.get(&index) {
            return Ok(Some(*node));
        }
        if self.stale.contains(&index) || self.truncated_to.is_some_and(|cut| index >= cut) {
            return Ok(None);
        }
        Ok(self
            .storage
            .read(index * NODE_SIZE, NODE_SIZE)?
            .and_then(|buf| Node::decode(index, &buf)))
    }

    /// Whether a node is available locally.
    pub fn has_node(&self, index: u64) -> Result<bool, CoreError> {
        Ok(self.get_node(index)?.is_some())
    }

    pub(crate) fn require_node(&self, index: u64) -> Result<Node, CoreError> {
        self.get_node(index)?.ok_or(CoreError::MissingNode(index))
    }

    /// Start staging changes against the current state.
    pub fn batch(&self) -> MerkleTreeBatch {
        MerkleTreeBatch::new(
            self.roots.clone(),
            self.length,
            self.byte_length,
            self.fork,
            self.signature.clone(),
        )
    }

    /// Apply a staged batch.
    ///
    /// Fails with [`CoreError::TreeChanged`] if the tree moved since the
    /// batch was created.
    pub fn commit(&mut self, batch: MerkleTreeBatch) -> Result<(), CoreError> {
        if batch.base_length != self.length || batch.base_fork != self.fork {
            return Err(CoreError::TreeChanged);
        }

        if batch.ancestors < batch.base_length {
            self.truncate_nodes(batch.ancestors);
        }

        self.unflushed.extend(batch.nodes);

        if batch.upgraded {
            self.roots = batch.roots;
            self.length = batch.length;
            self.byte_length = batch.byte_length;
            self.fork = batch.fork;
            self.signature = batch.signature;
            trace!(length = self.length, fork = self.fork, "committed upgrade");
        }

        Ok(())
    }

    /// Stage a shrink to `length` blocks under a new `fork`.
    ///
    /// The returned batch still has to be signed and committed.
    pub fn truncate(&self, length: u64, fork: u64) -> Result<MerkleTreeBatch, CoreError> {
        if length > self.length {
            return Err(CoreError::OutOfBounds {
                index: length,
                length: self.length,
            });
        }

        let mut roots = Vec::new();
        for index in flat_tree::full_roots(2 * length) {
            roots.push(self.require_node(index)?);
        }

        let mut batch = self.batch();
        batch.byte_length = total_size(&roots)
            .ok_or_else(|| CoreError::Storage("stored root sizes overflow".to_string()))?;
        batch.roots = roots;
        batch.length = length;
        batch.fork = fork;
        batch.ancestors = length;
        batch.signature = None;
        batch.upgraded = true;
        Ok(batch)
    }

    /// Forget every node that covers a leaf at or past `length`.
    fn truncate_nodes(&mut self, length: u64) {
        let head = 2 * length;

        self.unflushed
            .retain(|index, _| flat_tree::right_span(*index) < head);
        self.truncated_to = Some(self.truncated_to.map_or(head, |cut| cut.min(head)));

        if length == 0 {
            return;
        }

        // Ancestors of the last kept leaf can sit below `head` while still
        // covering removed leaves.
        let mut index = head - 2;
        loop {
            index = flat_tree::parent(index);
            if flat_tree::left_span(index) == 0 && index >= head {
                break;
            }
            if index < head && flat_tree::right_span(index) >= head {
                self.stale.insert(index);
            }
        }
    }

    /// Write committed nodes and pending truncations to storage.
    pub fn flush(&mut self) -> Result<(), CoreError> {
        let cut = self.truncated_to.take();

        if let Some(cut) = cut {
            if self.storage.len()? > cut * NODE_SIZE {
                self.storage.truncate(cut * NODE_SIZE)?;
            }
        }

        let blank = [0u8; NODE_SIZE as usize];
        for index in &self.stale {
            if cut.map_or(true, |cut| *index < cut) {
                self.storage.write(index * NODE_SIZE, &blank)?;
            }
        }
        self.stale.clear();

        for node in self.unflushed.values() {
            self.storage.write(node.index * NODE_SIZE, &node.encode())?;
        }
        self.unflushed.clear();

        self.storage.sync()
    }

    /// Byte offset where block `index` starts.
    pub fn byte_offset(&self, index: u64) -> Result<u64, CoreError> {
        if index == self.length {
            return Ok(self.byte_length);
        }
        if index > self.length {
            return Err(CoreError::OutOfBounds {
                index,
                length: self.length,
            });
        }
        offset_in(&self.roots, 2 * index, |i| self.get_node(i))
    }

    /// Number of siblings a request for flat index `index` needs to reach a
    /// node stored locally. `0` when `index` itself is stored, and also when
    /// it lies past the current length, where only an upgrade can prove it.
    pub fn missing_nodes(&self, index: u64) -> Result<u64, CoreError> {
        if flat_tree::right_span(index) >= 2 * self.length {
            return Ok(0);
        }

        let mut count = 0;
        let mut cur = index;
        while !self.roots.iter().any(|r| r.index == cur) && !self.has_node(cur)? {
            count += 1;
            cur = flat_tree::parent(cur);
        }
        Ok(count)
    }

    // =========================================================================
    // Proof generation
    // =========================================================================

    /// Build the proof answering `request` against the current state.
    ///
    /// Block and hash paths carry the number of siblings asked for. A block
    /// at or past the upgrade's start gets its full path instead, up to the
    /// root the upgrade proves. Block values are left empty; the caller fills
    /// them from its payload store.
    pub fn proof(&self, request: &ProofRequest) -> Result<Proof, CoreError> {
        if request.fork != self.fork {
            return Err(CoreError::ForkConflict {
                local: self.fork,
                remote: request.fork,
            });
        }

        let mut proof = Proof {
            fork: self.fork,
            ..Default::default()
        };

        if let Some(upgrade) = request.upgrade {
            let end = upgrade.start.saturating_add(upgrade.length);
            if upgrade.start >= self.length || end > self.length {
                return Err(CoreError::OutOfBounds {
                    index: end,
                    length: self.length,
                });
            }
            let signature = self
                .signature
                .clone()
                .ok_or_else(|| CoreError::Header("tree has no signature".to_string()))?;
            proof.upgrade = Some(DataUpgrade {
                start: upgrade.start,
                length: self.length - upgrade.start,
                nodes: self.upgrade_nodes(upgrade.start)?,
                signature,
            });
        }

        if let Some(block) = request.block {
            if block.index >= self.length {
                return Err(CoreError::OutOfBounds {
                    index: block.index,
                    length: self.length,
                });
            }
            let max = match request.upgrade {
                Some(upgrade) if block.index >= upgrade.start => u64::MAX,
                _ => block.nodes,
            };
            proof.block = Some(DataBlock {
                index: block.index,
                value: Vec::new(),
                nodes: self.path(2 * block.index, max)?,
            });
        }

        if let Some(hash) = request.hash {
            if flat_tree::right_span(hash.index) >= 2 * self.length {
                return Err(CoreError::OutOfBounds {
                    index: hash.index,
                    length: self.length,
                });
            }
            let mut nodes = vec![self.require_node(hash.index)?];
            nodes.extend(self.path(hash.index, hash.nodes)?);
            proof.hash = Some(DataHash {
                index: hash.index,
                nodes,
            });
        }

        if let Some(seek) = request.seek {
            proof.seek = self.seek_proof(seek.bytes)?;
        }

        Ok(proof)
    }

    /// Siblings from `index` up to its root, at most `max` of them.
    fn path(&self, index: u64, max: u64) -> Result<Vec<Node>, CoreError> {
        let root = self
            .roots
            .iter()
            .find(|r| covers(r.index, index))
            .ok_or(CoreError::OutOfBounds {
                index,
                length: self.length,
            })?;

        let mut nodes = Vec::new();
        let mut cur = index;
        while cur != root.index {
            if nodes.len() as u64 >= max {
                break;
            }
            nodes.push(self.require_node(flat_tree::sibling(cur))?);
            cur = flat_tree::parent(cur);
        }
        Ok(nodes)
    }

    /// Nodes that grow the roots at `start` into the current roots, in the
    /// order the verifier consumes them.
    fn upgrade_nodes(&self, start: u64) -> Result<Vec<Node>, CoreError> {
        let old = flat_tree::full_roots(2 * start);
        let new = flat_tree::full_roots(2 * self.length);
        let mut nodes = Vec::new();

        let mut i = 0;
        while i < old.len() && i < new.len() && old[i] == new[i] {
            i += 1;
        }

        if i < old.len() && i < new.len() {
            let target = new[i];
            let mut stack = old[i..].to_vec();
            let mut cur = stack.pop().unwrap_or(target);
            while cur != target {
                let sibling = flat_tree::sibling(cur);
                if stack.last() == Some(&sibling) {
                    stack.pop();
                } else {
                    nodes.push(self.require_node(sibling)?);
                }
                cur = flat_tree::parent(cur);
            }
            i += 1;
        }

        for index in &new[i..] {
            nodes.push(self.require_node(*index)?);
        }
        Ok(nodes)
    }

    fn seek_proof(&self, bytes: u64) -> Result<Option<DataSeek>, CoreError> {
        let Locate::Found { index, .. } = self.locate(bytes)? else {
            return Ok(None);
        };

        let leaf = 2 * index;
        let nodes = match self.require_node(leaf).and_then(|node| {
            let mut nodes = vec![node];
            nodes.extend(self.path(leaf, u64::MAX)?);
            Ok(nodes)
        }) {
            Ok(nodes) => nodes,
            Err(CoreError::MissingNode(_)) => return Ok(None),
            Err(e) => return Err(e),
        };

        Ok(Some(DataSeek { bytes, nodes }))
    }

    // =========================================================================
    // Verification
    // =========================================================================

    /// Check a remote proof against the trusted state.
    ///
    /// Returns an uncommitted batch holding every verified node. The tree is
    /// not modified.
    pub fn verify(
        &self,
        proof: &Proof,
        auth: &dyn Authorization,
    ) -> Result<MerkleTreeBatch, CoreError> {
        if proof.fork != self.fork {
            return Err(CoreError::ForkConflict {
                local: self.fork,
                remote: proof.fork,
            });
        }

        let mut batch = self.batch();

        if let Some(upgrade) = &proof.upgrade {
            self.verify_upgrade(proof.fork, upgrade, &mut batch, auth)?;
        }

        if let Some(block) = &proof.block {
            if block.index >= batch.length {
                return Err(CoreError::invalid_proof(format!(
                    "block {} is past length {}",
                    block.index, batch.length
                )));
            }
            let leaf = Node::leaf(block.index, &block.value);
            let verified = self.verify_path(&batch, leaf, &block.nodes)?;
            insert_all(&mut batch, verified);
        }

        if let Some(hash) = &proof.hash {
            let (node, siblings) = hash
                .nodes
                .split_first()
                .ok_or_else(|| CoreError::invalid_proof("hash proof has no nodes"))?;
            if node.index != hash.index || flat_tree::right_span(node.index) >= 2 * batch.length {
                return Err(CoreError::invalid_proof(format!(
                    "hash proof for node {} is out of place",
                    node.index
                )));
            }
            let verified = self.verify_path(&batch, *node, siblings)?;
            insert_all(&mut batch, verified);
        }

        if let Some(seek) = &proof.seek {
            let (leaf, siblings) = seek
                .nodes
                .split_first()
                .ok_or_else(|| CoreError::invalid_proof("seek proof has no nodes"))?;
            if leaf.index % 2 != 0 || leaf.index >= 2 * batch.length {
                return Err(CoreError::invalid_proof("seek proof does not end at a leaf"));
            }
            let verified = self.verify_path(&batch, *leaf, siblings)?;
            insert_all(&mut batch, verified);
            self.check_seek(&batch, seek.bytes, leaf)?;
        }

        Ok(batch)
    }

    fn verify_upgrade(
        &self,
        fork: u64,
        upgrade: &DataUpgrade,
        batch: &mut MerkleTreeBatch,
        auth: &dyn Authorization,
    ) -> Result<(), CoreError> {
        if upgrade.start < self.length {
            // Answer to a request made before the tree grew.
            return Err(CoreError::TreeChanged);
        }
        if upgrade.start > self.length || upgrade.length == 0 {
            return Err(CoreError::invalid_proof(format!(
                "upgrade {}+{} does not extend length {}",
                upgrade.start, upgrade.length, self.length
            )));
        }
        let length = upgrade
            .start
            .checked_add(upgrade.length)
            .ok_or_else(|| CoreError::invalid_proof("upgrade length overflows"))?;

        let old = flat_tree::full_roots(2 * upgrade.start);
        let new = flat_tree::full_roots(2 * length);
        let mut queue = upgrade.nodes.iter();
        let mut roots = Vec::with_capacity(new.len());

        let mut i = 0;
        while i < old.len() && i < new.len() && old[i] == new[i] {
            roots.push(self.roots[i]);
            i += 1;
        }

        if i < old.len() && i < new.len() {
            let target = new[i];
            let mut stack: Vec<Node> = self.roots[i..].to_vec();
            let mut cur = stack
                .pop()
                .ok_or_else(|| CoreError::invalid_proof("upgrade has no base root"))?;

            while cur.index != target {
                if flat_tree::depth(cur.index) >= flat_tree::depth(target) {
                    return Err(CoreError::invalid_proof("upgrade overshoots its root"));
                }
                let sibling_index = flat_tree::sibling(cur.index);
                let on_stack = stack.last().is_some_and(|top| top.index == sibling_index);
                let sibling = match stack.pop() {
                    Some(top) if on_stack => top,
                    other => {
                        stack.extend(other);
                        let node = take_node(&mut queue, sibling_index)?;
                        batch.nodes.insert(node.index, node);
                        node
                    }
                };
                cur = Node::parent(&cur, &sibling)?;
                batch.nodes.insert(cur.index, cur);
            }

            roots.push(cur);
            i += 1;
        }

        for index in &new[i..] {
            let node = take_node(&mut queue, *index)?;
            batch.nodes.insert(node.index, node);
            roots.push(node);
        }

        if queue.next().is_some() {
            return Err(CoreError::invalid_proof("upgrade carries extra nodes"));
        }
        let byte_length = total_size(&roots)
            .ok_or_else(|| CoreError::invalid_proof("upgrade roots overflow the byte length"))?;

        let signable = auth.signable(&hash_roots(&roots), length, fork);
        if !auth.accept(&signable, &upgrade.signature) {
            return Err(CoreError::InvalidSignature);
        }

        batch.byte_length = byte_length;
        batch.roots = roots;
        batch.length = length;
        batch.signature = Some(upgrade.signature.clone());
        batch.upgraded = true;
        Ok(())
    }

    fn verify_path(
        &self,
        batch: &MerkleTreeBatch,
        start: Node,
        siblings: &[Node],
    ) -> Result<Vec<Node>, CoreError> {
        let head = 2 * self.length;
        walk_path(start, siblings, |index| {
            if let Some(node) = batch.nodes.get(&index) {
                return Ok(Some(*node));
            }
            if flat_tree::right_span(index) < head {
                return self.get_node(index);
            }
            Ok(None)
        })
    }

    fn check_seek(
        &self,
        batch: &MerkleTreeBatch,
        bytes: u64,
        leaf: &Node,
    ) -> Result<(), CoreError> {
        let offset = match offset_in(&batch.roots, leaf.index, |index| {
            match batch.nodes.get(&index) {
                Some(node) => Ok(Some(*node)),
                None => self.get_node(index),
            }
        }) {
            Ok(offset) => offset,
            Err(CoreError::MissingNode(_)) => return Ok(()),
            Err(e) => return Err(e),
        };

        if bytes < offset || bytes >= offset.saturating_add(leaf.size) {
            return Err(CoreError::invalid_proof(format!(
                "leaf {} does not contain byte {}",
                leaf.index / 2,
                bytes
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MerkleTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MerkleTree")
            .field("length", &self.length)
            .field("byte_length", &self.byte_length)
            .field("fork", &self.fork)
            .field("roots", &self.roots.len())
            .finish()
    }
}

/// Whether `ancestor` is `index` or lies above it.
fn covers(ancestor: u64, index: u64) -> bool {
    flat_tree::left_span(ancestor) <= flat_tree::left_span(index)
        && flat_tree::right_span(index) <= flat_tree::right_span(ancestor)
}

fn insert_all(batch: &mut MerkleTreeBatch, nodes: Vec<Node>) {
    for node in nodes {
        batch.nodes.insert(node.index, node);
    }
}

fn take_node(queue: &mut std::slice::Iter<'_, Node>, expected: u64) -> Result<Node, CoreError> {
    match queue.next() {
        Some(node) if node.index == expected => Ok(*node),
        Some(node) => Err(CoreError::invalid_proof(format!(
            "expected node {}, got {}",
            expected, node.index
        ))),
        None => Err(CoreError::invalid_proof(format!("missing node {}", expected))),
    }
}

/// Hash a proof path upward from `start` through every sibling in `siblings`.
///
/// Every node on the way that `trusted` knows must match it, and the last
/// node reached must be known. Returns `start`, the siblings and every
/// computed parent.
pub(crate) fn walk_path<F>(
    start: Node,
    siblings: &[Node],
    mut trusted: F,
) -> Result<Vec<Node>, CoreError>
where
    F: FnMut(u64) -> Result<Option<Node>, CoreError>,
{
    let mut verified = Vec::with_capacity(2 * siblings.len() + 1);
    verified.push(start);
    let mut cur = start;
    let mut siblings = siblings.iter();

    loop {
        let known = trusted(cur.index)?;
        if let Some(node) = known {
            if node.hash != cur.hash || node.size != cur.size {
                return Err(CoreError::invalid_proof(format!(
                    "node {} does not match the trusted tree",
                    cur.index
                )));
            }
        }

        let Some(sibling) = siblings.next() else {
            return match known {
                Some(_) => Ok(verified),
                None => Err(CoreError::invalid_proof(format!(
                    "path stops at untrusted node {}",
                    cur.index
                ))),
            };
        };
        if sibling.index != flat_tree::sibling(cur.index) {
            return Err(CoreError::invalid_proof(format!(
                "node {} is not the sibling of {}",
                sibling.index, cur.index
            )));
        }
        if let Some(node) = trusted(sibling.index)? {
            if node.hash != sibling.hash || node.size != sibling.size {
                return Err(CoreError::invalid_proof(format!(
                    "node {} does not match the trusted tree",
                    sibling.index
                )));
            }
        }

        cur = Node::parent(&cur, sibling)?;
        verified.push(*sibling);
        verified.push(cur);
    }
}

/// Byte offset of flat index `target` under `roots`.
fn offset_in<F>(roots: &[Node], target: u64, mut lookup: F) -> Result<u64, CoreError>
where
    F: FnMut(u64) -> Result<Option<Node>, CoreError>,
{
    let mut offset = 0;
    for root in roots {
        if !covers(root.index, target) {
            offset += root.size;
            continue;
        }

        let mut cur = root.index;
        while cur != target {
            let (left, right) = flat_tree::children(cur).ok_or(CoreError::MissingNode(target))?;
            if flat_tree::right_span(target) <= flat_tree::right_span(left) {
                cur = left;
            } else {
                offset += lookup(left)?.ok_or(CoreError::MissingNode(left))?.size;
                cur = right;
            }
        }
        return Ok(offset);
    }

    Err(CoreError::MissingNode(target))
}
