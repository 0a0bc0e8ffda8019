//! Error types for the appendable logs.

use std::{io, path::PathBuf};

use snafu::Snafu;

/// Result type alias for appendable operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur on an appendable log.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    /// A caller-supplied argument is invalid.
    #[snafu(display("illegal arguments: {what}"))]
    IllegalArguments {
        /// The offending parameter.
        what: String,
    },

    /// The log was opened read-only and a mutator was invoked.
    #[snafu(display("appendable is read-only"))]
    ReadOnly,

    /// The log was closed and an operation was invoked.
    #[snafu(display("appendable is already closed"))]
    AlreadyClosed,

    /// A multi-file log was opened on a path that is not a directory.
    #[snafu(display("path is not a directory: {}", path.display()))]
    PathIsNotADirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// The on-disk layout is malformed.
    #[snafu(display("corrupted appendable: {reason}"))]
    Corrupted {
        /// Description of what was corrupted.
        reason: String,
    },

    /// I/O error from the underlying file.
    #[snafu(display("I/O error: {source}"))]
    Io {
        /// The underlying I/O error.
        source: io::Error,
    },
}

impl From<io::Error> for Error {
    fn from(source: io::Error) -> Self {
        Error::Io { source }
    }
}
