//! # Omega Crypto - Tree Hashing and Signing Primitives
//!
//! Every digest that ends up inside a signed root is produced here, so the
//! rest of the workspace can treat hashing and signing as opaque functions.
//!
//! ## Components
//!
//! | Module | Algorithm | Use Case |
//! |--------|-----------|----------|
//! | `hashing` | BLAKE3, one-byte type tags | Leaf, parent and root digests |
//! | `signatures` | Ed25519 | Signing the 48-byte signable |
//! | `keys` | BLAKE3 keyed | Discovery key, per-connection capability |
//! | `block_encryption` | BLAKE3 XOF stream | Optional block confidentiality |
//!
//! ## Security Properties
//!
//! - **Domain separation**: leaf (`0`), parent (`1`) and root (`2`) inputs never collide
//! - **Child ordering**: parents always hash the lower flat index first
//! - **Ed25519**: deterministic nonces, no RNG dependency when signing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod block_encryption;
pub mod errors;
pub mod hashing;
pub mod keys;
pub mod signatures;

// Re-exports
pub use block_encryption::{BlockEncryption, BLOCK_PADDING};
pub use errors::CryptoError;
pub use hashing::{
    blake3_hash, hash_leaf, hash_parent, hash_roots, signable, Blake3Hasher, Hash, TreeDigest,
    SIGNABLE_SIZE,
};
pub use keys::{capability, discovery_key};
pub use signatures::{Ed25519KeyPair, Ed25519PublicKey, Ed25519Signature};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    #[test]
    fn test_version() {
        assert!(!super::VERSION.is_empty());
    }
}
