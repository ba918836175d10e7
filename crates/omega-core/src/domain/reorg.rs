//! Fork reconciliation.
//!
//! A peer announcing a higher fork proves its roots with a signed upgrade
//! from length zero. The [`ReorgBatch`] then searches for the last block the
//! two histories share: starting at the first remote root that differs from
//! the local tree it fetches both children of the current node, descends
//! right when the left child matches locally and left otherwise, and stops
//! at a leaf. Each round costs one hash request.

use crate::domain::batch::MerkleTreeBatch;
use crate::domain::errors::CoreError;
use crate::domain::flat_tree;
use crate::domain::node::{total_size, Node};
use crate::domain::proof::{Proof, ProofRequest, RequestHash};
use crate::domain::tree::{walk_path, MerkleTree};
use crate::ports::outbound::Authorization;
use omega_crypto::hash_roots;
use std::collections::BTreeMap;
use tracing::debug;

/// Next node the ancestor search needs from the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReorgWant {
    /// First block under the node being descended.
    pub start: u64,
    /// End (exclusive) of the blocks under that node.
    pub end: u64,
    /// Flat index of the node to request (its sibling comes along).
    pub index: u64,
    /// Path nodes to request with it.
    pub nodes: u64,
}

/// An in-progress switch to a remote fork.
#[derive(Debug, Clone)]
pub struct ReorgBatch {
    batch: MerkleTreeBatch,
    /// Node still needed, if the search is not finished.
    pub want: Option<ReorgWant>,
    /// Whether the common prefix is known.
    pub finished: bool,
}

impl MerkleTree {
    /// Begin adopting the history proven by `proof`.
    ///
    /// The proof must be an upgrade from length zero at a fork above the
    /// local one, signed by `auth`.
    pub fn reorg(&self, proof: &Proof, auth: &dyn Authorization) -> Result<ReorgBatch, CoreError> {
        if proof.fork <= self.fork() {
            return Err(CoreError::ForkConflict {
                local: self.fork(),
                remote: proof.fork,
            });
        }

        let upgrade = proof
            .upgrade
            .as_ref()
            .ok_or_else(|| CoreError::invalid_proof("reorg proof carries no upgrade"))?;
        if upgrade.start != 0 {
            return Err(CoreError::invalid_proof("reorg upgrade must start at zero"));
        }

        let length = upgrade.length;
        let indices = flat_tree::full_roots(2 * length);
        if indices.len() != upgrade.nodes.len() {
            return Err(CoreError::invalid_proof(format!(
                "expected {} roots, got {}",
                indices.len(),
                upgrade.nodes.len()
            )));
        }
        for (expected, node) in indices.iter().zip(&upgrade.nodes) {
            if node.index != *expected {
                return Err(CoreError::invalid_proof(format!(
                    "expected root {}, got {}",
                    expected, node.index
                )));
            }
        }

        let roots = upgrade.nodes.clone();
        let byte_length = total_size(&roots)
            .ok_or_else(|| CoreError::invalid_proof("reorg roots overflow the byte length"))?;
        let signable = auth.signable(&hash_roots(&roots), length, proof.fork);
        if !auth.accept(&signable, &upgrade.signature) {
            return Err(CoreError::InvalidSignature);
        }

        let mut batch = self.batch();
        batch.nodes = roots.iter().map(|r| (r.index, *r)).collect::<BTreeMap<_, _>>();
        batch.byte_length = byte_length;
        batch.roots = roots;
        batch.length = length;
        batch.fork = proof.fork;
        batch.signature = Some(upgrade.signature.clone());
        batch.ancestors = 0;
        batch.upgraded = true;

        let mut reorg = ReorgBatch {
            batch,
            want: None,
            finished: false,
        };
        reorg.update_want(self)?;

        debug!(
            fork = proof.fork,
            length,
            finished = reorg.finished,
            "started reorg"
        );
        Ok(reorg)
    }
}

impl ReorgBatch {
    /// Fork being adopted.
    pub fn fork(&self) -> u64 {
        self.batch.fork
    }

    /// Remote length being adopted.
    pub fn length(&self) -> u64 {
        self.batch.length
    }

    /// Blocks shared with the local history, once finished.
    pub fn ancestors(&self) -> u64 {
        self.batch.ancestors
    }

    /// Request for the next search round, if one is needed.
    pub fn request(&self) -> Option<ProofRequest> {
        self.want.map(|want| ProofRequest {
            fork: self.batch.fork,
            hash: Some(RequestHash {
                index: want.index,
                nodes: want.nodes,
            }),
            ..Default::default()
        })
    }

    /// Feed the answer to [`request`](Self::request).
    pub fn update(&mut self, tree: &MerkleTree, proof: &Proof) -> Result<(), CoreError> {
        if proof.fork != self.batch.fork {
            return Err(CoreError::ForkConflict {
                local: self.batch.fork,
                remote: proof.fork,
            });
        }

        let hash = proof
            .hash
            .as_ref()
            .ok_or_else(|| CoreError::invalid_proof("reorg round carries no hash proof"))?;
        let (node, siblings) = hash
            .nodes
            .split_first()
            .ok_or_else(|| CoreError::invalid_proof("hash proof has no nodes"))?;
        if node.index != hash.index {
            return Err(CoreError::invalid_proof("hash proof is out of place"));
        }

        let nodes = &self.batch.nodes;
        let verified = walk_path(*node, siblings, |index| Ok(nodes.get(&index).copied()))?;
        for node in verified {
            self.batch.nodes.insert(node.index, node);
        }

        self.update_want(tree)
    }

    /// Turn the finished search into a batch ready to commit.
    pub fn into_batch(self) -> Result<MerkleTreeBatch, CoreError> {
        if !self.finished {
            return Err(CoreError::BadArgument("reorg is not finished".to_string()));
        }
        Ok(self.batch)
    }

    fn matches(&self, tree: &MerkleTree, index: u64) -> Result<bool, CoreError> {
        let Some(remote) = self.batch.nodes.get(&index) else {
            return Ok(false);
        };
        if flat_tree::right_span(index) >= 2 * tree.length() {
            return Ok(false);
        }
        Ok(tree
            .get_node(index)?
            .is_some_and(|local: Node| local.hash == remote.hash))
    }

    fn update_want(&mut self, tree: &MerkleTree) -> Result<(), CoreError> {
        let local_length = tree.length();
        let mut ancestors = 0;
        self.want = None;

        let roots: Vec<u64> = self.batch.roots.iter().map(|r| r.index).collect();
        for root in roots {
            if self.matches(tree, root)? {
                ancestors = flat_tree::right_span(root) / 2 + 1;
                continue;
            }

            let mut cur = root;
            loop {
                // Nothing under this node exists locally.
                if flat_tree::left_span(cur) / 2 >= local_length {
                    break;
                }
                let Some((left, right)) = flat_tree::children(cur) else {
                    break;
                };
                if !self.batch.nodes.contains_key(&left) || !self.batch.nodes.contains_key(&right) {
                    let (start, end) = flat_tree::block_range(cur);
                    self.want = Some(ReorgWant {
                        start,
                        end,
                        index: left,
                        nodes: 1,
                    });
                    return Ok(());
                }
                if self.matches(tree, left)? {
                    ancestors = flat_tree::right_span(left) / 2 + 1;
                    cur = right;
                } else {
                    cur = left;
                }
            }
            break;
        }

        self.batch.ancestors = ancestors.min(local_length);
        self.finished = true;
        debug!(
            fork = self.batch.fork,
            ancestors = self.batch.ancestors,
            "reorg common prefix found"
        );
        Ok(())
    }
}
