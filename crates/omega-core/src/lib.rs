//! # Omega Core
//!
//! An append-only log whose every block can be proven against one signed
//! root.
//!
//! **Architecture:** Hexagonal (Domain + Ports/Adapters)
//!
//! ## Purpose
//!
//! A core is identified by a public key. The writer appends blocks and signs
//! `hash_roots(roots) || length || fork`; readers fetch blocks from untrusted
//! peers and check each one with a compact Merkle proof.
//!
//! ## Guarantees
//!
//! | Guarantee | Mechanism |
//! |-----------|-----------|
//! | Tamper evidence | Every accepted node hashes up to a signed root |
//! | Atomic appends | Tree state only changes on batch commit |
//! | Rewrite detection | Truncation bumps the fork id, which is signed |
//! | Pluggable trust | Root acceptance goes through the `Authorization` port |
//!
//! ## Module Structure
//!
//! ```text
//! omega-core/
//! ├── domain/          # flat-tree math, MerkleTree, batches, proofs, seek, reorg, bitfield, header
//! ├── ports/           # RandomAccess storage + Authorization policy
//! ├── adapters/        # memory and file storage, Ed25519 authorization
//! ├── application/     # Core service
//! └── config.rs        # CoreConfig
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use omega_core::{Core, CoreConfig};
//!
//! let mut core = Core::memory(CoreConfig::default())?;
//! core.append(&["hello", "world"])?;
//! assert_eq!(core.get(1)?, Some(b"world".to_vec()));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

// Re-exports
pub use adapters::{Ed25519Authorization, FailingStorage, FileStorage, FnSigner, MemoryStorage};
pub use application::{
    AppendOutcome, Core, CoreInfo, CoreStats, CoreStorage, ReorgOutcome, VerifyOutcome,
};
pub use config::{CoreConfig, DEFAULT_MAX_CHUNK_SIZE};
pub use domain::{
    flat_tree, Bitfield, CoreError, DataBlock, DataHash, DataSeek, DataUpgrade, Hash, Header,
    MerkleTree, MerkleTreeBatch, Node, Proof, ProofRequest, ReorgBatch, ReorgWant, RequestBlock,
    RequestHash, RequestSeek, RequestUpgrade, Seeker, BITS_PER_PAGE, NODE_SIZE, WORDS_PER_PAGE,
};
pub use ports::{Authorization, RandomAccess};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
