//! # BLAKE3 Tree Hashing
//!
//! Digests for the append-only Merkle tree. Every input is prefixed with a
//! one-byte type tag and every length is encoded as `u64` little endian.
//!
//! | Digest | Input |
//! |--------|-------|
//! | leaf | `0x00 \|\| u64le(len) \|\| data` |
//! | parent | `0x01 \|\| u64le(a.size + b.size) \|\| a.hash \|\| b.hash` |
//! | roots | `0x02 \|\| (hash \|\| u64le(index) \|\| u64le(size))*` |

use blake3::Hasher;

/// BLAKE3 hash output (256-bit).
pub type Hash = [u8; 32];

/// Type tag for leaf digests.
pub const LEAF_TYPE: u8 = 0;
/// Type tag for parent digests.
pub const PARENT_TYPE: u8 = 1;
/// Type tag for root-set digests.
pub const ROOT_TYPE: u8 = 2;

/// Size of the signable message: root digest, length, fork.
pub const SIGNABLE_SIZE: usize = 32 + 8 + 8;

/// Anything that carries the three fields a tree digest is computed from.
pub trait TreeDigest {
    /// Flat-tree index.
    fn index(&self) -> u64;
    /// Bytes covered by the subtree.
    fn size(&self) -> u64;
    /// Digest of the subtree.
    fn hash(&self) -> &Hash;
}

/// Stateful BLAKE3 hasher.
pub struct Blake3Hasher {
    inner: Hasher,
}

impl Blake3Hasher {
    /// Create new hasher.
    pub fn new() -> Self {
        Self {
            inner: Hasher::new(),
        }
    }

    /// Create keyed hasher.
    pub fn new_keyed(key: &[u8; 32]) -> Self {
        Self {
            inner: Hasher::new_keyed(key),
        }
    }

    /// Update with data.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Finalize and return hash.
    pub fn finalize(&self) -> Hash {
        let hash = self.inner.finalize();
        *hash.as_bytes()
    }

    /// Fill `out` with the extendable output of the hasher.
    pub fn fill_xof(&self, out: &mut [u8]) {
        self.inner.finalize_xof().fill(out);
    }
}

impl Default for Blake3Hasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash data with BLAKE3 (one-shot, untagged).
pub fn blake3_hash(data: &[u8]) -> Hash {
    *blake3::hash(data).as_bytes()
}

/// Digest of a leaf holding `data`.
pub fn hash_leaf(data: &[u8]) -> Hash {
    let mut hasher = Blake3Hasher::new();
    hasher
        .update(&[LEAF_TYPE])
        .update(&(data.len() as u64).to_le_bytes())
        .update(data);
    hasher.finalize()
}

/// Digest of the parent of `a` and `b`, or `None` if their sizes do not
/// fit in a `u64`.
///
/// Children are ordered by flat index, so `hash_parent(a, b) == hash_parent(b, a)`.
pub fn hash_parent<N: TreeDigest + ?Sized>(a: &N, b: &N) -> Option<Hash> {
    let (left, right) = if a.index() > b.index() { (b, a) } else { (a, b) };
    let size = left.size().checked_add(right.size())?;

    let mut hasher = Blake3Hasher::new();
    hasher
        .update(&[PARENT_TYPE])
        .update(&size.to_le_bytes())
        .update(left.hash())
        .update(right.hash());
    Some(hasher.finalize())
}

/// Digest of an ordered root set.
pub fn hash_roots<N: TreeDigest>(roots: &[N]) -> Hash {
    let mut hasher = Blake3Hasher::new();
    hasher.update(&[ROOT_TYPE]);
    for root in roots {
        hasher
            .update(root.hash())
            .update(&root.index().to_le_bytes())
            .update(&root.size().to_le_bytes());
    }
    hasher.finalize()
}

/// The only message ever signed: `root_hash || u64le(length) || u64le(fork)`.
pub fn signable(root_hash: &Hash, length: u64, fork: u64) -> [u8; SIGNABLE_SIZE] {
    let mut out = [0u8; SIGNABLE_SIZE];
    out[..32].copy_from_slice(root_hash);
    out[32..40].copy_from_slice(&length.to_le_bytes());
    out[40..].copy_from_slice(&fork.to_le_bytes());
    out
}
