//! Proof requests and responses.
//!
//! A request names up to four sub-requests; the response carries the nodes
//! that satisfy each one. Node lists are consumed bottom-up.

use crate::domain::node::Node;
use serde::{Deserialize, Serialize};

/// Ask for a block value and its Merkle path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestBlock {
    /// Block index.
    pub index: u64,
    /// Siblings wanted, counted from the leaf. Ignored when the block lies
    /// past the start of an upgrade in the same request, which always
    /// carries the full path.
    pub nodes: u64,
}

/// Ask for a node (by flat index) and its Merkle path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestHash {
    /// Flat index of the node.
    pub index: u64,
    /// Siblings wanted, counted from the node.
    pub nodes: u64,
}

/// Ask for the path of the block containing a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestSeek {
    /// Byte offset.
    pub bytes: u64,
}

/// Ask for a signed extension of the tree beyond `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestUpgrade {
    /// Length the requester already trusts.
    pub start: u64,
    /// Minimum number of blocks the extension must add.
    pub length: u64,
}

/// A proof request against one fork.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofRequest {
    /// Fork the request is made against.
    pub fork: u64,
    /// Block sub-request.
    pub block: Option<RequestBlock>,
    /// Hash sub-request.
    pub hash: Option<RequestHash>,
    /// Seek sub-request.
    pub seek: Option<RequestSeek>,
    /// Upgrade sub-request.
    pub upgrade: Option<RequestUpgrade>,
}

/// Block value plus the sibling nodes on its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlock {
    /// Block index.
    pub index: u64,
    /// Stored block bytes.
    pub value: Vec<u8>,
    /// Sibling nodes, leaf level first.
    pub nodes: Vec<Node>,
}

/// A node and the sibling nodes on its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHash {
    /// Flat index of the proven node.
    pub index: u64,
    /// The proven node followed by its siblings, bottom-up.
    pub nodes: Vec<Node>,
}

/// Path of the leaf containing a byte offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSeek {
    /// Byte offset that was sought.
    pub bytes: u64,
    /// The containing leaf followed by its siblings, bottom-up.
    pub nodes: Vec<Node>,
}

/// Signed extension of the tree from `start` to `start + length`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataUpgrade {
    /// Length the extension starts from.
    pub start: u64,
    /// Blocks added.
    pub length: u64,
    /// Nodes that grow the old roots into the new roots, in consumption order.
    pub nodes: Vec<Node>,
    /// Signature over the new tree's signable.
    pub signature: Vec<u8>,
}

/// Response to a [`ProofRequest`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Fork the proof was built against.
    pub fork: u64,
    /// Block part.
    pub block: Option<DataBlock>,
    /// Hash part.
    pub hash: Option<DataHash>,
    /// Seek part.
    pub seek: Option<DataSeek>,
    /// Upgrade part.
    pub upgrade: Option<DataUpgrade>,
}

impl ProofRequest {
    /// Request carrying only an upgrade.
    pub fn upgrade(fork: u64, start: u64, length: u64) -> Self {
        Self {
            fork,
            upgrade: Some(RequestUpgrade { start, length }),
            ..Default::default()
        }
    }

    /// Request for a single block.
    pub fn block(fork: u64, index: u64, nodes: u64) -> Self {
        Self {
            fork,
            block: Some(RequestBlock { index, nodes }),
            ..Default::default()
        }
    }
}

impl Proof {
    /// Whether the response answers only sub-requests that were asked for.
    pub fn matches(&self, request: &ProofRequest) -> bool {
        if let Some(block) = &self.block {
            if request.block.map(|b| b.index) != Some(block.index) {
                return false;
            }
        }
        if let Some(hash) = &self.hash {
            if request.hash.map(|h| h.index) != Some(hash.index) {
                return false;
            }
        }
        if let Some(seek) = &self.seek {
            if request.seek.map(|s| s.bytes) != Some(seek.bytes) {
                return false;
            }
        }
        if self.upgrade.is_some() && request.upgrade.is_none() {
            return false;
        }
        true
    }
}
