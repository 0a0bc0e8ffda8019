//! Error types for the index tree.

use std::io;

use snafu::Snafu;

/// Result type alias for index operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on the index tree.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// Key not present in the indexed key space.
    #[snafu(display("key not found"))]
    KeyNotFound,

    /// The tree (or a snapshot of it) was closed and then used.
    #[snafu(display("index is already closed"))]
    AlreadyClosed,

    /// The tree was opened read-only and a mutator was invoked.
    #[snafu(display("index is read-only"))]
    ReadOnly,

    /// A caller-supplied argument is invalid.
    #[snafu(display("illegal arguments: {what}"))]
    IllegalArguments {
        /// The offending parameter.
        what: String,
    },

    /// An on-disk node or root record is malformed.
    #[snafu(display("corrupted index: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// Error from the backing appendable logs.
    #[snafu(display("index log error: {source}"))]
    Appendable {
        /// The underlying appendable error.
        source: quiverdb_appendable::Error,
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

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
