//! Staged tree mutations.
//!
//! Appends, truncations, verified proofs and reorgs all land in a
//! [`MerkleTreeBatch`] first. Nothing about the tree changes until
//! [`MerkleTree::commit`](crate::domain::tree::MerkleTree::commit) accepts
//! the batch, so a failed signature leaves the tree untouched.

use crate::domain::errors::{CoreError, Hash};
use crate::domain::flat_tree;
use crate::domain::node::Node;
use crate::ports::outbound::Authorization;
use omega_crypto::hash_roots;
use std::collections::BTreeMap;

/// Uncommitted tree state.
#[derive(Debug, Clone)]
pub struct MerkleTreeBatch {
    pub(crate) base_length: u64,
    pub(crate) base_fork: u64,
    pub(crate) roots: Vec<Node>,
    pub(crate) length: u64,
    pub(crate) byte_length: u64,
    pub(crate) fork: u64,
    pub(crate) nodes: BTreeMap<u64, Node>,
    pub(crate) ancestors: u64,
    pub(crate) signature: Option<Vec<u8>>,
    pub(crate) upgraded: bool,
}

impl MerkleTreeBatch {
    pub(crate) fn new(
        roots: Vec<Node>,
        length: u64,
        byte_length: u64,
        fork: u64,
        signature: Option<Vec<u8>>,
    ) -> Self {
        Self {
            base_length: length,
            base_fork: fork,
            roots,
            length,
            byte_length,
            fork,
            nodes: BTreeMap::new(),
            ancestors: length,
            signature,
            upgraded: false,
        }
    }

    /// Append one block, returning its leaf.
    pub fn append(&mut self, data: &[u8]) -> Result<Node, CoreError> {
        let leaf = Node::leaf(self.length, data);
        self.append_root(leaf)?;
        Ok(leaf)
    }

    /// Push a full subtree that starts right after the current length and
    /// merge roots while the last two are siblings.
    pub(crate) fn append_root(&mut self, node: Node) -> Result<(), CoreError> {
        self.byte_length = self
            .byte_length
            .checked_add(node.size)
            .ok_or_else(|| CoreError::BadArgument("byte length overflows".to_string()))?;
        self.nodes.insert(node.index, node);
        self.length += flat_tree::leaves(node.index);
        self.roots.push(node);
        self.upgraded = true;

        while self.roots.len() > 1 {
            let b = self.roots[self.roots.len() - 1];
            let a = self.roots[self.roots.len() - 2];
            if flat_tree::sibling(a.index) != b.index {
                break;
            }
            self.roots.truncate(self.roots.len() - 2);
            let parent = Node::parent(&a, &b)?;
            self.nodes.insert(parent.index, parent);
            self.roots.push(parent);
        }
        Ok(())
    }

    /// Root digest of the staged state.
    pub fn hash(&self) -> Hash {
        hash_roots(&self.roots)
    }

    /// Bytes the authorization policy signs for the staged state.
    pub fn signable(&self, auth: &dyn Authorization) -> Vec<u8> {
        auth.signable(&self.hash(), self.length, self.fork)
    }

    /// Attach a signature over [`signable`](Self::signable).
    pub fn set_signature(&mut self, signature: Vec<u8>) {
        self.signature = Some(signature);
    }

    /// A node staged in this batch.
    pub fn get(&self, index: u64) -> Option<&Node> {
        self.nodes.get(&index)
    }

    /// Staged roots.
    pub fn roots(&self) -> &[Node] {
        &self.roots
    }

    /// Staged length in blocks.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Staged length in bytes.
    pub fn byte_length(&self) -> u64 {
        self.byte_length
    }

    /// Staged fork id.
    pub fn fork(&self) -> u64 {
        self.fork
    }

    /// Blocks shared with the tree this batch was staged against.
    pub fn ancestors(&self) -> u64 {
        self.ancestors
    }

    /// Length of the tree this batch was staged against.
    pub fn base_length(&self) -> u64 {
        self.base_length
    }

    /// Whether committing changes length, roots or fork.
    pub fn upgraded(&self) -> bool {
        self.upgraded
    }
}
