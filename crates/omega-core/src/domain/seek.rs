//! Byte-offset seeking.
//!
//! Descends from the roots using the byte size carried on every node. When a
//! node on the way down is not stored, the seeker reports which block range
//! a peer has to prove before it can continue.

use crate::domain::errors::CoreError;
use crate::domain::flat_tree;
use crate::domain::tree::MerkleTree;

/// Result of descending towards a byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Locate {
    /// Offset lies in block `index`, `offset` bytes in.
    Found { index: u64, offset: u64 },
    /// The children of `node` are needed to continue.
    Missing { node: u64 },
    /// Offset equals the byte length.
    End,
    /// Offset lies past the byte length.
    Beyond,
}

impl MerkleTree {
    /// Start seeking to byte `bytes`.
    pub fn seek(&self, bytes: u64) -> Seeker {
        Seeker {
            bytes,
            start: 0,
            end: 0,
        }
    }

    pub(crate) fn locate(&self, bytes: u64) -> Result<Locate, CoreError> {
        if bytes == self.byte_length() {
            return Ok(Locate::End);
        }
        if bytes > self.byte_length() {
            return Ok(Locate::Beyond);
        }

        let mut rel = bytes;
        for root in self.roots() {
            if rel >= root.size {
                rel -= root.size;
                continue;
            }

            let mut cur = root.index;
            while let Some((left, right)) = flat_tree::children(cur) {
                let Some(node) = self.get_node(left)? else {
                    return Ok(Locate::Missing { node: cur });
                };
                // Empty blocks never contain an offset, so ties go right.
                if rel < node.size {
                    cur = left;
                } else {
                    rel -= node.size;
                    cur = right;
                }
            }
            return Ok(Locate::Found {
                index: cur / 2,
                offset: rel,
            });
        }

        Ok(Locate::Beyond)
    }
}

/// Cursor resolving a byte offset to `(block, offset within block)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seeker {
    /// Byte offset being sought.
    pub bytes: u64,
    /// First block of the range still to fetch.
    pub start: u64,
    /// End (exclusive) of the range still to fetch.
    pub end: u64,
}

impl Seeker {
    /// Try to resolve against the local tree.
    ///
    /// Returns `None` when more nodes are needed; [`start`](Self::start) and
    /// [`end`](Self::end) then name the blocks to ask for. An empty range
    /// means the offset lies past the known length and only an upgrade helps.
    pub fn update(&mut self, tree: &MerkleTree) -> Result<Option<(u64, u64)>, CoreError> {
        match tree.locate(self.bytes)? {
            Locate::Found { index, offset } => Ok(Some((index, offset))),
            Locate::End => Ok(Some((tree.length(), 0))),
            Locate::Beyond => {
                self.start = tree.length();
                self.end = tree.length();
                Ok(None)
            }
            Locate::Missing { node } => {
                let (start, end) = flat_tree::block_range(node);
                self.start = start;
                self.end = end;
                Ok(None)
            }
        }
    }

    /// Whether the last update ran past the known length.
    pub fn needs_upgrade(&self) -> bool {
        self.start == self.end
    }
}
