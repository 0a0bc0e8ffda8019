//! Error types for the transaction store.

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the transaction store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Commit was called with an empty batch.
    #[snafu(display("no entries provided"))]
    NoEntriesProvided,

    /// Two entries in one batch share a key.
    #[snafu(display("duplicated key"))]
    DuplicatedKey,

    /// Too many commits in flight.
    #[snafu(display("max concurrency exceeded"))]
    MaxConcurrencyExceeded,

    /// The batch has more entries than the per-transaction cap.
    #[snafu(display("max tx entries exceeded: {nentries} (max {max})"))]
    MaxTxEntriesExceeded {
        /// Entries in the rejected batch.
        nentries: usize,
        /// Configured cap.
        max: u32,
    },

    /// A key exceeds the per-key byte cap.
    #[snafu(display("max key length exceeded: {len} (max {max})"))]
    MaxKeyLenExceeded {
        /// Length of the rejected key.
        len: usize,
        /// Configured cap.
        max: u32,
    },

    /// A value exceeds the per-value byte cap.
    #[snafu(display("max value length exceeded: {len} (max {max})"))]
    MaxValueLenExceeded {
        /// Length of the rejected value.
        len: usize,
        /// Configured cap.
        max: u32,
    },

    /// The requested linear proof spans too many transactions.
    #[snafu(display("max linear proof length exceeded: {span} (max {max})"))]
    MaxLinearProofLenExceeded {
        /// Number of terms the proof would carry.
        span: u64,
        /// Configured cap.
        max: u64,
    },

    /// The store was closed and an operation was invoked.
    #[snafu(display("store is already closed"))]
    AlreadyClosed,

    /// A caller-supplied argument is invalid.
    #[snafu(display("illegal arguments: {what}"))]
    IllegalArguments {
        /// The offending parameter.
        what: String,
    },

    /// The store was opened read-only and a mutator was invoked.
    #[snafu(display("store is read-only"))]
    ReadOnly,

    /// The store path exists and is not a directory.
    #[snafu(display("path is not a directory: {}", path.display()))]
    PathIsNotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Another process holds the store directory lock.
    #[snafu(display("store directory is already locked: {}", path.display()))]
    AlreadyLocked {
        /// The locked directory.
        path: PathBuf,
    },

    /// The requested transaction id is not committed.
    #[snafu(display("tx {tx_id} not found"))]
    TxNotFound {
        /// The requested transaction id.
        tx_id: u64,
    },

    /// The key is not present in the transaction or index.
    #[snafu(display("key not found"))]
    KeyNotFound,

    /// A transaction record failed to decode or cross-check.
    #[snafu(display("corrupted tx data at tx {tx_id}"))]
    CorruptedTxData {
        /// The affected transaction id.
        tx_id: u64,
    },

    /// Value bytes failed digest verification or could not be read back.
    #[snafu(display("corrupted value data"))]
    CorruptedValueData,

    /// The commit log is inconsistent with the other logs.
    #[snafu(display("corrupted commit log: {reason}"))]
    CorruptedCommitLog {
        /// Description of the inconsistency.
        reason: String,
    },

    /// The store was opened without an index directory.
    #[snafu(display("indexing is disabled for this store"))]
    IndexingDisabled,

    /// The background indexer stopped on an error.
    #[snafu(display("indexer failed: {reason}"))]
    IndexerFailed {
        /// The recorded failure.
        reason: String,
    },

    /// Error from an underlying appendable log.
    #[snafu(display("log error: {source}"))]
    Appendable {
        /// The underlying appendable error.
        source: quiverdb_appendable::Error,
    },

    /// Error from the index tree.
    #[snafu(display("index error: {source}"))]
    Index {
        /// The underlying index error.
        source: quiverdb_index::Error,
    },

    /// I/O error.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },
}

impl From<quiverdb_appendable::Error> for Error {
    fn from(source: quiverdb_appendable::Error) -> Self {
        Error::Appendable { source }
    }
}

impl From<quiverdb_index::Error> for Error {
    fn from(source: quiverdb_index::Error) -> Self {
        Error::Index { source }
    }
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_names_parameters() {
        assert_eq!(
            format!("{}", Error::MaxKeyLenExceeded { len: 2000, max: 1024 }),
            "max key length exceeded: 2000 (max 1024)"
        );
        assert_eq!(format!("{}", Error::TxNotFound { tx_id: 7 }), "tx 7 not found");
        assert_eq!(
            format!("{}", Error::MaxLinearProofLenExceeded { span: 5000, max: 1000 }),
            "max linear proof length exceeded: 5000 (max 1000)"
        );
    }

    #[test]
    fn test_source_chain_preserved() {
        use std::error::Error as StdError;

        let err = Error::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(err.source().is_some());
    }
}
