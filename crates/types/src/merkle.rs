//! Per-transaction Merkle trees.
//!
//! Every committed transaction carries the root of a Merkle tree whose leaves
//! are its entry digests sorted by key. Uses rs_merkle with SHA-256.

use rs_merkle::{algorithms::Sha256 as RsSha256, MerkleProof as RsMerkleProof, MerkleTree as RsMerkleTree};

use crate::hash::{Hash, EMPTY_HASH};

/// Merkle tree over a fixed set of leaf digests.
pub struct MerkleTree {
    tree: RsMerkleTree<RsSha256>,
    width: usize,
}

impl MerkleTree {
    /// Builds a Merkle tree from leaf digests.
    ///
    /// For empty input, the root is EMPTY_HASH.
    pub fn from_leaves(leaves: &[Hash]) -> Self {
        let tree = RsMerkleTree::<RsSha256>::from_leaves(leaves);
        Self { tree, width: leaves.len() }
    }

    /// Returns the Merkle root.
    pub fn root(&self) -> Hash {
        self.tree.root().unwrap_or(EMPTY_HASH)
    }

    /// Returns the number of leaves.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Whether the tree has no leaves.
    pub fn is_empty(&self) -> bool {
        self.width == 0
    }

    /// Generates an inclusion proof for the leaf at `index`.
    pub fn proof(&self, index: usize) -> Option<InclusionProof> {
        if index >= self.width {
            return None;
        }

        let proof = self.tree.proof(&[index]);

        Some(InclusionProof {
            leaf_index: index as u32,
            width: self.width as u32,
            terms: proof.proof_hashes().to_vec(),
        })
    }
}

/// Inclusion proof for a single leaf.
///
/// Carries the tree width so the verifier can reconstruct the tree shape for
/// any leaf count, not just powers of two. The leaf digest and expected root
/// are supplied independently by the verifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionProof {
    /// Index of the proven leaf.
    pub leaf_index: u32,
    /// Total number of leaves in the tree.
    pub width: u32,
    /// Sibling digests from leaf to root.
    pub terms: Vec<Hash>,
}

impl InclusionProof {
    /// Verifies the proof: does `leaf` at `leaf_index` fold up to
    /// `expected_root` in a tree of `width` leaves?
    pub fn verify(&self, leaf: Hash, expected_root: Hash) -> bool {
        if self.leaf_index >= self.width {
            return false;
        }

        let proof = RsMerkleProof::<RsSha256>::new(self.terms.clone());
        proof.verify(expected_root, &[self.leaf_index as usize], &[leaf], self.width as usize)
    }
}
