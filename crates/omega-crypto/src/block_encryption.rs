//! # Block Encryption
//!
//! XOR-stream encryption of block payloads keyed by block index and fork.
//!
//! ## Layout
//!
//! ```text
//! [ 8 byte blinded fork ][ ciphertext ... ]
//! ```
//!
//! The fork id is XORed with a keystream from the blinding key so it can
//! serve as the second half of the payload nonce without leaking. The
//! keystream is the BLAKE3 keyed extendable output over a 24-byte nonce.

use crate::errors::CryptoError;
use crate::hashing::{blake3_hash, Blake3Hasher};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Bytes prepended to every encrypted block.
pub const BLOCK_PADDING: usize = 8;

const NONCE_SIZE: usize = 24;

/// Per-core block cipher.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct BlockEncryption {
    key: [u8; 32],
    blinding_key: [u8; 32],
}

impl BlockEncryption {
    /// Create from a 32-byte key.
    pub fn new(key: [u8; 32]) -> Self {
        let blinding_key = blake3_hash(&key);
        Self { key, blinding_key }
    }

    /// Bytes of padding added to each block.
    pub fn padding(&self) -> usize {
        BLOCK_PADDING
    }

    /// Encrypt `plaintext` as block `index` of fork `fork`.
    pub fn encrypt(&self, index: u64, plaintext: &[u8], fork: u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(BLOCK_PADDING + plaintext.len());
        out.extend_from_slice(&fork.to_le_bytes());
        out.extend_from_slice(plaintext);

        let (padding, body) = out.split_at_mut(BLOCK_PADDING);
        xor(&self.blinding_key, &nonce(index, None), padding);
        xor(&self.key, &nonce(index, Some(padding)), body);

        out
    }

    /// Decrypt block `index`, stripping the padding.
    pub fn decrypt(&self, index: u64, block: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if block.len() < BLOCK_PADDING {
            return Err(CryptoError::BlockTooShort(block.len()));
        }

        let (padding, body) = block.split_at(BLOCK_PADDING);
        let mut out = body.to_vec();
        xor(&self.key, &nonce(index, Some(padding)), &mut out);
        Ok(out)
    }
}

impl std::fmt::Debug for BlockEncryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BlockEncryption { .. }")
    }
}

fn nonce(index: u64, rest: Option<&[u8]>) -> [u8; NONCE_SIZE] {
    let mut out = [0u8; NONCE_SIZE];
    out[..8].copy_from_slice(&index.to_le_bytes());
    if let Some(rest) = rest {
        let len = rest.len().min(NONCE_SIZE - 8);
        out[8..8 + len].copy_from_slice(&rest[..len]);
    }
    out
}

fn xor(key: &[u8; 32], nonce: &[u8; NONCE_SIZE], buf: &mut [u8]) {
    let mut stream = vec![0u8; buf.len()];
    let mut hasher = Blake3Hasher::new_keyed(key);
    hasher.update(nonce);
    hasher.fill_xof(&mut stream);

    for (b, k) in buf.iter_mut().zip(stream.iter()) {
        *b ^= k;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let enc = BlockEncryption::new([5u8; 32]);
        let block = enc.encrypt(3, b"hello world", 1);

        assert_eq!(block.len(), 11 + BLOCK_PADDING);
        assert_ne!(&block[BLOCK_PADDING..], b"hello world");
        assert_eq!(enc.decrypt(3, &block).unwrap(), b"hello world");
    }

    #[test]
    fn test_fork_changes_ciphertext() {
        let enc = BlockEncryption::new([5u8; 32]);
        assert_ne!(enc.encrypt(0, b"data", 0), enc.encrypt(0, b"data", 1));
    }

    #[test]
    fn test_index_changes_ciphertext() {
        let enc = BlockEncryption::new([5u8; 32]);
        assert_ne!(enc.encrypt(0, b"data", 0), enc.encrypt(1, b"data", 0));
    }

    #[test]
    fn test_wrong_key_garbles() {
        let a = BlockEncryption::new([1u8; 32]);
        let b = BlockEncryption::new([2u8; 32]);
        let block = a.encrypt(0, b"secret", 0);
        assert_ne!(b.decrypt(0, &block).unwrap(), b"secret");
    }

    #[test]
    fn test_short_block_rejected() {
        let enc = BlockEncryption::new([1u8; 32]);
        assert_eq!(enc.decrypt(0, &[1, 2]), Err(CryptoError::BlockTooShort(2)));
    }

    #[test]
    fn test_empty_block() {
        let enc = BlockEncryption::new([1u8; 32]);
        let block = enc.encrypt(4, b"", 2);
        assert_eq!(block.len(), BLOCK_PADDING);
        assert!(enc.decrypt(4, &block).unwrap().is_empty());
    }
}
