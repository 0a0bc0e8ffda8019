//! SHA-256 helpers for QuiverDB.
//!
//! All digests in the engine are SHA-256: value hashes, entry digests,
//! per-transaction Merkle roots, inner hashes and the accumulated hash chain.

use sha2::{Digest, Sha256};

/// SHA-256 hash output (32 bytes).
pub type Hash = [u8; 32];

/// Hash of empty input: SHA-256("").
///
/// Used as the root of an empty Merkle tree. NOT zero bytes.
pub const EMPTY_HASH: Hash = [
    0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f, 0xb9, 0x24,
    0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b, 0x78, 0x52, 0xb8, 0x55,
];

/// Zero hash: 32 zero bytes.
///
/// The accumulated hash before the first transaction, and the root of the
/// binary-linking tree before any leaf is appended.
pub const ZERO_HASH: Hash = [0u8; 32];

/// Compute SHA-256 of arbitrary data.
#[inline]
pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Compute SHA-256 over the concatenation of hash inputs.
///
/// `sha256_concat(&[l, r])` is the interior-node hash used by every tree in
/// the engine, and `sha256_concat(&[prev_alh, inner_hash])` advances the
/// accumulated hash chain.
pub fn sha256_concat(hashes: &[Hash]) -> Hash {
    let mut hasher = Sha256::new();
    for h in hashes {
        hasher.update(h);
    }
    hasher.finalize().into()
}
