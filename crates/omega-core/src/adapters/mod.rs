//! Adapters layer - storage backends and the default authorization policy.
//!
//! - `memory`: shared in-memory buffers (tests, ephemeral cores)
//! - `file`: one locked file per storage region
//! - `auth`: single-key Ed25519 authorization and function-backed signers

pub mod auth;
pub mod file;
pub mod memory;

pub use auth::{Ed25519Authorization, FnSigner};
pub use file::FileStorage;
pub use memory::{FailingStorage, MemoryStorage};
