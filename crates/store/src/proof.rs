//! Linear and dual proofs between committed transactions.
//!
//! Verifiers are free functions returning `bool`: a proof that does not
//! verify is not an error. The trusted and target accumulated hashes are
//! supplied by the caller from an independent source (a previously verified
//! commit, a stored root, a peer).

use quiverdb_types::{linking, sha256_concat, Hash};
use sha2::{Digest, Sha256};

/// The commitment fields of a transaction header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxHeader {
    /// Transaction id.
    pub id: u64,
    /// Commit wall-clock seconds.
    pub ts: i64,
    /// Last transaction covered by the embedded binary-linking tree.
    pub bl_tx_id: u64,
    /// Root of that tree.
    pub bl_root: Hash,
    /// Number of entries.
    pub nentries: u32,
    /// Merkle root over the entry digests.
    pub eh: Hash,
    /// Accumulated hash of the previous transaction.
    pub prev_alh: Hash,
}

impl TxHeader {
    /// Commitment to `id ‖ ts ‖ bl_tx_id ‖ bl_root ‖ nentries ‖ eh`.
    pub fn inner_hash(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(self.id.to_be_bytes());
        hasher.update(self.ts.to_be_bytes());
        hasher.update(self.bl_tx_id.to_be_bytes());
        hasher.update(self.bl_root);
        hasher.update(self.nentries.to_be_bytes());
        hasher.update(self.eh);
        hasher.finalize().into()
    }

    /// Accumulated hash: `SHA-256(prev_alh ‖ inner_hash)`.
    pub fn alh(&self) -> Hash {
        sha256_concat(&[self.prev_alh, self.inner_hash()])
    }
}

/// Proof of accumulated-hash evolution by listing intermediate inner hashes.
///
/// `terms[0]` is `alh(from)`; each later term is the inner hash of the next
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearProof {
    /// First covered transaction.
    pub from: u64,
    /// Last covered transaction.
    pub to: u64,
    /// `alh(from)` followed by `inner_hash(from+1) … inner_hash(to)`.
    pub terms: Vec<Hash>,
}

/// Verifies a linear proof against independently obtained endpoint hashes.
pub fn verify_linear_proof(
    proof: &LinearProof,
    from: u64,
    to: u64,
    from_alh: Hash,
    to_alh: Hash,
) -> bool {
    if proof.from != from || proof.to != to || from == 0 || from > to {
        return false;
    }
    if proof.terms.len() as u64 != to - from + 1 {
        return false;
    }
    if proof.terms[0] != from_alh {
        return false;
    }

    let mut alh = proof.terms[0];
    for inner in &proof.terms[1..] {
        alh = sha256_concat(&[alh, *inner]);
    }
    alh == to_alh
}

/// Logarithmic proof linking two transactions through the binary-linking
/// tree.
///
/// `source` is the smaller-id endpoint, `target` the larger. The target's
/// embedded tree covers every transaction below it, so three paths suffice:
/// inclusion of the source's accumulated hash, inclusion of the target's
/// predecessor hash as the last leaf, and consistency between the two
/// embedded trees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DualProof {
    /// Header of the smaller-id endpoint.
    pub source: TxHeader,
    /// Header of the larger-id endpoint.
    pub target: TxHeader,
    /// Path of `alh(source.id)` in the target's embedded tree.
    pub inclusion: Vec<Hash>,
    /// Consistency path between the source's and target's embedded trees.
    pub consistency: Vec<Hash>,
    /// Path of `target.prev_alh` as the last leaf of the target's tree.
    pub last_inclusion: Vec<Hash>,
}

/// Verifies a dual proof in either argument order: `(from, to, alh(from),
/// alh(to))` may name the endpoints in any direction.
pub fn verify_dual_proof(
    proof: &DualProof,
    from: u64,
    to: u64,
    from_alh: Hash,
    to_alh: Hash,
) -> bool {
    if from == 0 || to == 0 {
        return false;
    }
    let (lo, hi, lo_alh, hi_alh) =
        if from <= to { (from, to, from_alh, to_alh) } else { (to, from, to_alh, from_alh) };

    if proof.source.id != lo || proof.target.id != hi {
        return false;
    }
    // Embedded trees must cover exactly the predecessors.
    if proof.source.bl_tx_id != lo - 1 || proof.target.bl_tx_id != hi - 1 {
        return false;
    }
    // Headers must reproduce the trusted endpoint hashes.
    if proof.source.alh() != lo_alh || proof.target.alh() != hi_alh {
        return false;
    }

    if lo == hi {
        return lo_alh == hi_alh;
    }

    // alh(lo) is leaf lo-1 of the target's embedded tree of size hi-1.
    if !linking::verify_inclusion(&proof.inclusion, lo - 1, hi - 1, lo_alh, proof.target.bl_root) {
        return false;
    }
    // Bind prev_alh(hi) to the same tree as its last leaf; with it, the
    // target header's alh recomputation above anchors the whole tree.
    if !linking::verify_inclusion(
        &proof.last_inclusion,
        hi - 2,
        hi - 1,
        proof.target.prev_alh,
        proof.target.bl_root,
    ) {
        return false;
    }
    // The target's tree must extend the source's.
    if lo > 1
        && !linking::verify_consistency(
            &proof.consistency,
            lo - 1,
            hi - 1,
            proof.source.bl_root,
            proof.target.bl_root,
        )
    {
        return false;
    }

    true
}
