//! Tree nodes and their on-disk record.

use crate::domain::errors::{CoreError, Hash};
use crate::domain::flat_tree;
use omega_crypto::{hash_leaf, hash_parent, TreeDigest};
use serde::{Deserialize, Serialize};

/// Bytes per persisted node: `u64le(size) || hash`.
pub const NODE_SIZE: u64 = 40;

/// A node of the append-only Merkle tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Flat-tree index.
    pub index: u64,
    /// Bytes covered by this subtree.
    pub size: u64,
    /// Digest of this subtree.
    pub hash: Hash,
}

impl Node {
    /// Leaf node for block `block_index` holding `data`.
    pub fn leaf(block_index: u64, data: &[u8]) -> Self {
        Self {
            index: 2 * block_index,
            size: data.len() as u64,
            hash: hash_leaf(data),
        }
    }

    /// Parent of two sibling nodes, in either order.
    ///
    /// Fails with [`CoreError::InvalidProof`] if the two sizes do not fit in
    /// a `u64`; sizes of remote nodes are not trusted.
    pub fn parent(a: &Node, b: &Node) -> Result<Self, CoreError> {
        let overflow = || {
            CoreError::invalid_proof(format!(
                "sizes of nodes {} and {} overflow",
                a.index, b.index
            ))
        };
        let size = a.size.checked_add(b.size).ok_or_else(overflow)?;
        let hash = hash_parent(a, b).ok_or_else(overflow)?;
        Ok(Self {
            index: flat_tree::parent(a.index),
            size,
            hash,
        })
    }

    /// Encode as a fixed-size storage record.
    pub fn encode(&self) -> [u8; NODE_SIZE as usize] {
        let mut out = [0u8; NODE_SIZE as usize];
        out[..8].copy_from_slice(&self.size.to_le_bytes());
        out[8..].copy_from_slice(&self.hash);
        out
    }

    /// Decode a storage record. All-zero records are absent nodes.
    pub fn decode(index: u64, buf: &[u8]) -> Option<Self> {
        if buf.len() < NODE_SIZE as usize || buf.iter().all(|b| *b == 0) {
            return None;
        }
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[..8]);
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&buf[8..40]);
        Some(Self {
            index,
            size: u64::from_le_bytes(size),
            hash,
        })
    }
}

/// Sum of the sizes of `nodes`, or `None` if it does not fit in a `u64`.
pub fn total_size(nodes: &[Node]) -> Option<u64> {
    nodes.iter().try_fold(0u64, |sum, node| sum.checked_add(node.size))
}

impl TreeDigest for Node {
    fn index(&self) -> u64 {
        self.index
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn hash(&self) -> &Hash {
        &self.hash
    }
}
