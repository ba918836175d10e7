//! # Outbound Ports
//!
//! Traits for the collaborators the core depends on: byte storage and the
//! authorization policy that signs and accepts tree roots.

use crate::domain::errors::{CoreError, Hash};

/// Byte-addressable storage.
///
/// One instance backs each region of a core (tree nodes, block payloads,
/// bitfield pages, header).
pub trait RandomAccess: Send {
    /// Read `length` bytes at `offset`.
    ///
    /// Returns `Ok(None)` when the range extends past the end of storage.
    /// Gaps that were never written read back as zeros.
    fn read(&self, offset: u64, length: u64) -> Result<Option<Vec<u8>>, CoreError>;

    /// Write `data` at `offset`, growing the storage as needed.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), CoreError>;

    /// Shrink (or zero-extend) the storage to `length` bytes.
    fn truncate(&mut self, length: u64) -> Result<(), CoreError>;

    /// Current length in bytes.
    fn len(&self) -> Result<u64, CoreError>;

    /// Whether nothing has been written yet.
    fn is_empty(&self) -> Result<bool, CoreError> {
        Ok(self.len()? == 0)
    }

    /// Make previous writes durable.
    fn sync(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    /// Release `[offset, offset + length)`.
    ///
    /// A range reaching the end of storage is cut off; anything else reads
    /// back as zeros.
    fn del(&mut self, offset: u64, length: u64) -> Result<(), CoreError> {
        let size = self.len()?;
        let end = offset.saturating_add(length).min(size);
        if offset >= end {
            return Ok(());
        }
        if end == size {
            return self.truncate(offset);
        }

        let zeros = vec![0u8; ZERO_CHUNK.min(end - offset) as usize];
        let mut at = offset;
        while at < end {
            let n = ZERO_CHUNK.min(end - at);
            self.write(at, &zeros[..n as usize])?;
            at += n;
        }
        Ok(())
    }
}

/// Largest zero buffer [`RandomAccess::del`] writes at once.
const ZERO_CHUNK: u64 = 64 * 1024;

/// Signing and acceptance policy for tree roots.
///
/// The default policy is a single Ed25519 key; multi-signature or
/// proof-of-work policies plug in here.
pub trait Authorization: Send + Sync {
    /// Identity key of the core this policy guards.
    fn public_key(&self) -> [u8; 32];

    /// Bytes that get signed for a tree state.
    fn signable(&self, root_hash: &Hash, length: u64, fork: u64) -> Vec<u8> {
        omega_crypto::signable(root_hash, length, fork).to_vec()
    }

    /// Whether `sign` can produce signatures.
    fn can_sign(&self) -> bool;

    /// Sign a signable message.
    fn sign(&self, signable: &[u8]) -> Result<Vec<u8>, CoreError>;

    /// Whether `signature` is accepted for `signable`.
    fn accept(&self, signable: &[u8], signature: &[u8]) -> bool;

    /// Secret seed to persist in the header, if the policy owns one.
    fn secret_seed(&self) -> Option<[u8; 32]> {
        None
    }
}
