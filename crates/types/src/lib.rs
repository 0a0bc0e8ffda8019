//! quiverdb-types: hashing and Merkle primitives for QuiverDB.
//!
//! This crate holds the cryptographic building blocks shared by the
//! transaction store and its verifiers:
//!
//! - SHA-256 helpers and the [`Hash`] type
//! - Per-transaction Merkle trees with entry inclusion proofs ([`merkle`])
//! - The append-only binary-linking tree over the accumulated-hash sequence,
//!   with inclusion and consistency proofs ([`linking`])
//!
//! Everything here is pure computation; no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod hash;
pub mod linking;
pub mod merkle;

pub use hash::{sha256, sha256_concat, Hash, EMPTY_HASH, ZERO_HASH};
pub use linking::{verify_consistency, verify_inclusion, LinkingTree};
pub use merkle::{InclusionProof, MerkleTree};
