//! Store configuration.

use std::path::PathBuf;

use quiverdb_appendable::{multi, CompressionFormat, Metadata, DEFAULT_COMPRESSION_LEVEL};
use quiverdb_index::TreeOptions;

use crate::error::{Error, Result};

/// Default per-transaction entry cap.
pub const DEFAULT_MAX_TX_ENTRIES: u32 = 1024;

/// Default per-key byte cap.
pub const DEFAULT_MAX_KEY_LEN: u32 = 1024;

/// Default per-value byte cap.
pub const DEFAULT_MAX_VALUE_LEN: u32 = 4096;

/// Default ceiling on in-flight commits.
pub const DEFAULT_MAX_CONCURRENCY: u32 = 100;

/// Default number of parallel value logs.
pub const DEFAULT_MAX_IO_CONCURRENCY: u32 = 1;

/// Default cap on linear proof terms.
pub const DEFAULT_MAX_LINEAR_PROOF_LEN: u64 = 1000;

/// Value logs are tagged in the top byte of a value offset.
pub(crate) const MAX_VALUE_LOGS: u32 = 127;

/// Metadata keys recorded in every log at store creation.
pub mod meta_keys {
    /// Logical bytes per chunk file.
    pub const FILE_SIZE: &str = "file_size";
    /// Per-transaction entry cap.
    pub const MAX_TX_ENTRIES: &str = "max_tx_entries";
    /// Per-key byte cap.
    pub const MAX_KEY_LEN: &str = "max_key_len";
    /// Per-value byte cap.
    pub const MAX_VALUE_LEN: &str = "max_value_len";
}

/// Index maintenance knobs.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    /// Serialized-size cap before an index node splits.
    pub max_node_size: usize,
    /// Flush the index every this many integrated transactions.
    pub flush_threshold: u64,
    /// Checkpoint pending index state after this much idle time.
    pub flush_interval: std::time::Duration,
    /// Capacity of the deserialized-node cache.
    pub cache_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            max_node_size: quiverdb_index::DEFAULT_MAX_NODE_SIZE,
            flush_threshold: 1000,
            flush_interval: std::time::Duration::from_secs(60),
            cache_size: quiverdb_index::DEFAULT_CACHE_SIZE,
        }
    }
}

/// Options for opening a [`Store`](crate::Store).
#[derive(Debug, Clone)]
pub struct Options {
    /// fsync every commit before returning.
    pub synced: bool,
    /// Reject mutators.
    pub read_only: bool,
    /// POSIX mode for new files.
    pub file_mode: u32,
    /// Logical bytes per chunk file of every log.
    pub file_size: u64,
    /// Per-transaction entry cap.
    pub max_tx_entries: u32,
    /// Per-key byte cap.
    pub max_key_len: u32,
    /// Per-value byte cap.
    pub max_value_len: u32,
    /// Ceiling on in-flight commits.
    pub max_concurrency: u32,
    /// Number of parallel value logs (and value-write workers).
    pub max_io_concurrency: u32,
    /// Cap on linear proof terms.
    pub max_linear_proof_len: u64,
    /// Chunk compression for the logs.
    pub compression_format: CompressionFormat,
    /// Codec-specific level; negative selects the codec default.
    pub compression_level: i32,
    /// Open-handle cap per multi-file log.
    pub max_opened_files: usize,
    /// Write buffer size per log file.
    pub buffer_size: usize,
    /// Index maintenance knobs.
    pub index: IndexOptions,
    /// Index location override. `open` defaults it to `<dir>/index`;
    /// `open_with` leaves indexing disabled when unset.
    pub index_dir: Option<PathBuf>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            synced: true,
            read_only: false,
            file_mode: 0o755,
            file_size: multi::DEFAULT_FILE_SIZE,
            max_tx_entries: DEFAULT_MAX_TX_ENTRIES,
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_io_concurrency: DEFAULT_MAX_IO_CONCURRENCY,
            max_linear_proof_len: DEFAULT_MAX_LINEAR_PROOF_LEN,
            compression_format: CompressionFormat::None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            max_opened_files: multi::DEFAULT_MAX_OPENED_FILES,
            buffer_size: 4096,
            index: IndexOptions::default(),
            index_dir: None,
        }
    }
}

impl Options {
    /// Sets synced mode.
    pub fn with_synced(mut self, synced: bool) -> Self {
        self.synced = synced;
        self
    }

    /// Sets read-only mode.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the POSIX mode for new files.
    pub fn with_file_mode(mut self, file_mode: u32) -> Self {
        self.file_mode = file_mode;
        self
    }

    /// Sets the logical bytes per chunk file.
    pub fn with_file_size(mut self, file_size: u64) -> Self {
        self.file_size = file_size;
        self
    }

    /// Sets the per-transaction entry cap.
    pub fn with_max_tx_entries(mut self, max_tx_entries: u32) -> Self {
        self.max_tx_entries = max_tx_entries;
        self
    }

    /// Sets the per-key byte cap.
    pub fn with_max_key_len(mut self, max_key_len: u32) -> Self {
        self.max_key_len = max_key_len;
        self
    }

    /// Sets the per-value byte cap.
    pub fn with_max_value_len(mut self, max_value_len: u32) -> Self {
        self.max_value_len = max_value_len;
        self
    }

    /// Sets the in-flight commit ceiling.
    pub fn with_max_concurrency(mut self, max_concurrency: u32) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    /// Sets the number of parallel value logs.
    pub fn with_max_io_concurrency(mut self, max_io_concurrency: u32) -> Self {
        self.max_io_concurrency = max_io_concurrency;
        self
    }

    /// Sets the linear proof cap.
    pub fn with_max_linear_proof_len(mut self, max_linear_proof_len: u64) -> Self {
        self.max_linear_proof_len = max_linear_proof_len;
        self
    }

    /// Sets the compression format.
    pub fn with_compression_format(mut self, format: CompressionFormat) -> Self {
        self.compression_format = format;
        self
    }

    /// Sets the compression level.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the open-handle cap per log.
    pub fn with_max_opened_files(mut self, max_opened_files: usize) -> Self {
        self.max_opened_files = max_opened_files;
        self
    }

    /// Sets the index maintenance knobs.
    pub fn with_index(mut self, index: IndexOptions) -> Self {
        self.index = index;
        self
    }

    /// Sets the index directory.
    pub fn with_index_dir(mut self, index_dir: PathBuf) -> Self {
        self.index_dir = Some(index_dir);
        self
    }

    /// Validates cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.file_size == 0 {
            return Err(Error::IllegalArguments { what: "file_size".to_string() });
        }
        if self.max_tx_entries == 0 {
            return Err(Error::IllegalArguments { what: "max_tx_entries".to_string() });
        }
        if self.max_key_len == 0 {
            return Err(Error::IllegalArguments { what: "max_key_len".to_string() });
        }
        if self.max_concurrency == 0 {
            return Err(Error::IllegalArguments { what: "max_concurrency".to_string() });
        }
        if self.max_io_concurrency == 0 || self.max_io_concurrency > MAX_VALUE_LOGS {
            return Err(Error::IllegalArguments { what: "max_io_concurrency".to_string() });
        }
        if self.max_linear_proof_len == 0 {
            return Err(Error::IllegalArguments { what: "max_linear_proof_len".to_string() });
        }
        if self.max_opened_files == 0 {
            return Err(Error::IllegalArguments { what: "max_opened_files".to_string() });
        }
        if self.buffer_size == 0 {
            return Err(Error::IllegalArguments { what: "buffer_size".to_string() });
        }
        if self.index.flush_threshold == 0 {
            return Err(Error::IllegalArguments { what: "index.flush_threshold".to_string() });
        }
        Ok(())
    }

    /// The metadata blob recorded in every log at store creation.
    pub fn log_metadata(&self) -> Vec<u8> {
        let mut md = Metadata::new();
        md.put_int(meta_keys::FILE_SIZE, self.file_size as i64)
            .put_int(meta_keys::MAX_TX_ENTRIES, self.max_tx_entries as i64)
            .put_int(meta_keys::MAX_KEY_LEN, self.max_key_len as i64)
            .put_int(meta_keys::MAX_VALUE_LEN, self.max_value_len as i64);
        md.to_bytes()
    }

    /// Adopts the creation-time limits recorded in a log's metadata; they
    /// bound decode buffers on reopen.
    pub(crate) fn adopt_metadata(&mut self, blob: &[u8]) {
        let Some(md) = Metadata::from_bytes(blob) else { return };
        if let Some(v) = md.get_int(meta_keys::FILE_SIZE) {
            self.file_size = v as u64;
        }
        if let Some(v) = md.get_int(meta_keys::MAX_TX_ENTRIES) {
            self.max_tx_entries = v as u32;
        }
        if let Some(v) = md.get_int(meta_keys::MAX_KEY_LEN) {
            self.max_key_len = v as u32;
        }
        if let Some(v) = md.get_int(meta_keys::MAX_VALUE_LEN) {
            self.max_value_len = v as u32;
        }
    }

    pub(crate) fn log_opts(&self, ext: &str) -> multi::Options {
        multi::Options::default()
            .with_read_only(self.read_only)
            .with_file_mode(self.file_mode)
            .with_file_size(self.file_size)
            .with_file_ext(ext)
            .with_max_opened_files(self.max_opened_files)
            .with_compression_format(self.compression_format)
            .with_compression_level(self.compression_level)
            .with_buffer_size(self.buffer_size)
            .with_metadata(self.log_metadata())
    }

    pub(crate) fn tree_opts(&self) -> TreeOptions {
        TreeOptions {
            read_only: self.read_only,
            file_mode: self.file_mode,
            file_size: self.file_size,
            max_opened_files: self.max_opened_files,
            max_node_size: self.index.max_node_size,
            cache_size: self.index.cache_size,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        Options::default().validate().unwrap();
    }

    #[test]
    fn test_invalid_options_rejected() {
        assert!(Options::default().with_file_size(0).validate().is_err());
        assert!(Options::default().with_max_tx_entries(0).validate().is_err());
        assert!(Options::default().with_max_io_concurrency(0).validate().is_err());
        assert!(Options::default().with_max_io_concurrency(500).validate().is_err());
        assert!(Options::default().with_max_concurrency(0).validate().is_err());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let opts = Options::default().with_file_size(1 << 20).with_max_key_len(64);
        let mut reopened = Options::default();
        reopened.adopt_metadata(&opts.log_metadata());
        assert_eq!(reopened.file_size, 1 << 20);
        assert_eq!(reopened.max_key_len, 64);
        assert_eq!(reopened.max_tx_entries, DEFAULT_MAX_TX_ENTRIES);
    }
}
