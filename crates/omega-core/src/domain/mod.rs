//! Domain layer - tree math, tree state and proofs.
//!
//! - `flat_tree`: flat index arithmetic
//! - `node`: tree nodes and their storage record
//! - `tree`, `batch`: the Merkle tree and staged mutations
//! - `proof`: request and response shapes
//! - `seek`, `reorg`: byte seeking and fork reconciliation
//! - `bitfield`, `header`: local presence and persisted core info

pub mod batch;
pub mod bitfield;
pub mod errors;
pub mod flat_tree;
pub mod header;
pub mod node;
pub mod proof;
pub mod reorg;
pub mod seek;
pub mod tree;

pub use batch::MerkleTreeBatch;
pub use bitfield::{Bitfield, BITS_PER_PAGE, WORDS_PER_PAGE};
pub use errors::{CoreError, Hash};
pub use header::Header;
pub use node::{Node, NODE_SIZE};
pub use proof::{
    DataBlock, DataHash, DataSeek, DataUpgrade, Proof, ProofRequest, RequestBlock, RequestHash,
    RequestSeek, RequestUpgrade,
};
pub use reorg::{ReorgBatch, ReorgWant};
pub use seek::Seeker;
pub use tree::MerkleTree;
