//! quiverdb-store: the core engine of an immutable, verifiable key-value
//! database.
//!
//! Every commit appends a batch of entries as one transaction to a totally
//! ordered log and binds it into an accumulating hash chain; a
//! per-transaction Merkle tree proves entry inclusion, and a binary-linking
//! tree over the chain yields compact proofs between any two transactions.
//! A background indexer maintains a copy-on-write B+ tree mapping each key
//! to its latest value locator and full write history.
//!
//! ```no_run
//! use quiverdb_store::{Options, Store, KV};
//!
//! let store = Store::open("data", Options::default())?;
//!
//! let summary = store.commit(&[KV::new(b"key".to_vec(), b"value".to_vec())])?;
//!
//! let mut tx = store.new_tx();
//! store.read_tx(summary.id, &mut tx)?;
//! let value = store.read_value(&tx, b"key")?;
//!
//! store.close()?;
//! # Ok::<(), quiverdb_store::Error>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;
mod indexer;
mod lock;
mod options;
pub mod proof;
mod reader;
mod store;
mod tx;

pub use error::{Error, Result};
pub use options::{
    IndexOptions, Options, DEFAULT_MAX_CONCURRENCY, DEFAULT_MAX_IO_CONCURRENCY,
    DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_LINEAR_PROOF_LEN, DEFAULT_MAX_TX_ENTRIES,
    DEFAULT_MAX_VALUE_LEN,
};
pub use proof::{verify_dual_proof, verify_linear_proof, DualProof, LinearProof, TxHeader};
pub use reader::TxReader;
pub use store::{v_log_dir, Store, TxSummary};
pub use tx::{Tx, TxEntry, KV};

// The index snapshot is the store's snapshot type.
pub use quiverdb_index::Snapshot;
