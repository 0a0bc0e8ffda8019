//! Multi-file append-only log.
//!
//! Presents one unbounded logical stream over a directory of fixed-size
//! chunk files named `{:016}.{ext}`. Each file holds exactly `file_size`
//! logical bytes once complete; only the highest-ordinal file is writable.
//! Completed files are immutable and reopened read-only on demand through an
//! LRU cache of at most `max_opened_files` handles.

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::{
    compression::{CompressionFormat, DEFAULT_COMPRESSION_LEVEL},
    error::{Error, Result},
    single::{self, FileAppendable, DEFAULT_BUFFER_SIZE, DEFAULT_FILE_MODE},
    Appendable,
};

/// Default logical bytes per chunk file: 512 MiB.
pub const DEFAULT_FILE_SIZE: u64 = 512 << 20;

/// Default cap on simultaneously opened chunk files.
pub const DEFAULT_MAX_OPENED_FILES: usize = 10;

/// Options for opening a [`MultiAppendable`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Reject all mutators.
    pub read_only: bool,
    /// POSIX mode for newly created files.
    pub file_mode: u32,
    /// Logical bytes per chunk file.
    pub file_size: u64,
    /// Extension for chunk files.
    pub file_ext: String,
    /// Cap on simultaneously opened chunk files.
    pub max_opened_files: usize,
    /// Chunk compression format for newly created files.
    pub compression_format: CompressionFormat,
    /// Codec-specific level; negative selects the codec default.
    pub compression_level: i32,
    /// In-memory write buffer size per file.
    pub buffer_size: usize,
    /// Caller metadata stored in every chunk file's header.
    pub metadata: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            file_mode: DEFAULT_FILE_MODE,
            file_size: DEFAULT_FILE_SIZE,
            file_ext: "aof".to_string(),
            max_opened_files: DEFAULT_MAX_OPENED_FILES,
            compression_format: CompressionFormat::None,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            metadata: Vec::new(),
        }
    }
}

impl Options {
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

    /// Sets the chunk file extension.
    pub fn with_file_ext(mut self, file_ext: impl Into<String>) -> Self {
        self.file_ext = file_ext.into();
        self
    }

    /// Sets the open-handle cap.
    pub fn with_max_opened_files(mut self, max_opened_files: usize) -> Self {
        self.max_opened_files = max_opened_files;
        self
    }

    /// Sets the compression format for new files.
    pub fn with_compression_format(mut self, format: CompressionFormat) -> Self {
        self.compression_format = format;
        self
    }

    /// Sets the compression level for new files.
    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Sets the per-file write buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the caller metadata blob.
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    fn single_opts(&self, read_only: bool) -> single::Options {
        single::Options {
            read_only,
            file_mode: self.file_mode,
            compression_format: self.compression_format,
            compression_level: self.compression_level,
            buffer_size: self.buffer_size,
            metadata: self.metadata.clone(),
        }
    }
}

struct MultiInner {
    dir: PathBuf,
    opts: Options,
    closed: bool,
    /// Ordinal of the writable tail file.
    current_id: u64,
    /// The writable tail file.
    current: FileAppendable,
    /// Read-only handles for completed files.
    cache: LruCache<u64, Arc<FileAppendable>>,
    /// Stream metadata, as recorded in the first chunk file.
    metadata: Vec<u8>,
}

/// Directory-striped append-only log.
pub struct MultiAppendable {
    inner: Mutex<MultiInner>,
}

impl MultiAppendable {
    /// Opens or creates a multi-file log in directory `path`.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let dir = path.as_ref().to_path_buf();

        if opts.file_size == 0 {
            return Err(Error::IllegalArguments { what: "file_size".to_string() });
        }
        if opts.max_opened_files == 0 {
            return Err(Error::IllegalArguments { what: "max_opened_files".to_string() });
        }
        if opts.file_ext.is_empty() {
            return Err(Error::IllegalArguments { what: "file_ext".to_string() });
        }

        if dir.exists() {
            if !dir.is_dir() {
                return Err(Error::PathIsNotADirectory { path: dir });
            }
        } else if opts.read_only {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("read-only open of missing directory {}", dir.display()),
                ),
            });
        } else {
            fs::create_dir_all(&dir)?;
        }

        let suffix = format!(".{}", opts.file_ext);
        let mut ids: Vec<u64> = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(&suffix) {
                if let Ok(id) = stem.parse::<u64>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();

        let cache_cap = NonZeroUsize::new(opts.max_opened_files)
            .ok_or_else(|| Error::IllegalArguments { what: "max_opened_files".to_string() })?;

        let (current_id, current, metadata) = match ids.last() {
            None => {
                if opts.read_only {
                    return Err(Error::Io {
                        source: std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            format!("no chunk files in {}", dir.display()),
                        ),
                    });
                }
                let file =
                    FileAppendable::open(chunk_path(&dir, 0, &opts.file_ext), opts.single_opts(false))?;
                debug!(dir = %dir.display(), "created multi-appendable");
                (0, file, opts.metadata.clone())
            }
            Some(&max_id) => {
                let file = FileAppendable::open(
                    chunk_path(&dir, max_id, &opts.file_ext),
                    opts.single_opts(opts.read_only),
                )?;
                let min_id = ids[0];
                let metadata = if min_id == max_id {
                    file.metadata()
                } else {
                    FileAppendable::open(
                        chunk_path(&dir, min_id, &opts.file_ext),
                        opts.single_opts(true),
                    )?
                    .metadata()
                };
                (max_id, file, metadata)
            }
        };

        // Files created after a reopen carry the same stream metadata as the
        // first chunk file.
        let mut opts = opts;
        opts.metadata = metadata.clone();

        Ok(Self {
            inner: Mutex::new(MultiInner {
                dir,
                opts,
                closed: false,
                current_id,
                current,
                cache: LruCache::new(cache_cap),
                metadata,
            }),
        })
    }

    fn check_open(inner: &MultiInner) -> Result<()> {
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    fn check_writable(inner: &MultiInner) -> Result<()> {
        Self::check_open(inner)?;
        if inner.opts.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

fn chunk_path(dir: &Path, id: u64, ext: &str) -> PathBuf {
    dir.join(format!("{id:016}.{ext}"))
}

impl MultiInner {
    fn chunk_path(&self, id: u64) -> PathBuf {
        chunk_path(&self.dir, id, &self.opts.file_ext)
    }

    fn logical_size(&self) -> Result<u64> {
        Ok(self.current_id * self.opts.file_size + self.current.size()?)
    }

    /// Completes the tail file and opens the next one.
    fn roll(&mut self) -> Result<()> {
        self.current.flush()?;
        let next_id = self.current_id + 1;
        let next = FileAppendable::open(
            self.chunk_path(next_id),
            self.opts.single_opts(false),
        )?;
        let old = std::mem::replace(&mut self.current, next);
        self.cache.put(self.current_id, Arc::new(old));
        self.current_id = next_id;
        Ok(())
    }

    /// Read-only handle for a completed file, through the LRU cache.
    fn completed_file(&mut self, id: u64) -> Result<Arc<FileAppendable>> {
        if let Some(f) = self.cache.get(&id) {
            return Ok(Arc::clone(f));
        }
        let file = Arc::new(FileAppendable::open(
            self.chunk_path(id),
            self.opts.single_opts(true),
        )?);
        self.cache.put(id, Arc::clone(&file));
        Ok(file)
    }
}

impl Appendable for MultiAppendable {
    fn metadata(&self) -> Vec<u8> {
        self.inner.lock().metadata.clone()
    }

    fn size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        inner.logical_size()
    }

    fn append(&self, data: &[u8]) -> Result<(u64, usize)> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        let off = inner.logical_size()?;
        if data.is_empty() {
            return Ok((off, 0));
        }

        let file_size = inner.opts.file_size;
        let mut written = 0;
        while written < data.len() {
            let avail = file_size - inner.current.size()?;
            if avail == 0 {
                inner.roll()?;
                continue;
            }
            let take = (data.len() - written).min(avail as usize);
            inner.current.append(&data[written..written + take])?;
            written += take;
        }

        Ok((off, written))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;

        if buf.is_empty() {
            return Err(Error::IllegalArguments { what: "buffer".to_string() });
        }
        let total = inner.logical_size()?;
        if offset > total {
            return Err(Error::IllegalArguments { what: "offset".to_string() });
        }

        let file_size = inner.opts.file_size;
        let mut done = 0;
        let mut pos = offset;
        while done < buf.len() && pos < total {
            let fid = pos / file_size;
            let inner_off = pos % file_size;
            let n = if fid == inner.current_id {
                inner.current.read_at(&mut buf[done..], inner_off)?
            } else {
                let file = inner.completed_file(fid)?;
                file.read_at(&mut buf[done..], inner_off)?
            };
            if n == 0 {
                break;
            }
            done += n;
            pos += n as u64;
        }

        Ok(done)
    }

    fn set_offset(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        let total = inner.logical_size()?;
        if offset > total {
            return Err(Error::IllegalArguments { what: "offset".to_string() });
        }
        if offset == total {
            return Ok(());
        }

        let file_size = inner.opts.file_size;
        let fid = offset / file_size;
        let inner_off = offset % file_size;

        if fid == inner.current_id {
            return inner.current.set_offset(inner_off);
        }

        // Truncation crosses file boundaries: delete later files and reopen
        // the target as the writable tail.
        debug!(
            dir = %inner.dir.display(),
            from = inner.current_id,
            to = fid,
            "truncating across chunk files"
        );
        for id in (fid + 1)..=inner.current_id {
            inner.cache.pop(&id);
            let path = inner.chunk_path(id);
            if id == inner.current_id {
                // The tail handle still points at this file; replaced below.
                continue;
            }
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        inner.cache.pop(&fid);
        let tail = FileAppendable::open(inner.chunk_path(fid), inner.opts.single_opts(false))?;
        tail.set_offset(inner_off)?;

        let old_tail_path = inner.chunk_path(inner.current_id);
        inner.current = tail;
        inner.current_id = fid;
        match fs::remove_file(&old_tail_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.current.flush()
    }

    fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.current.sync()
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if !inner.opts.read_only {
            inner.current.close()?;
        }
        inner.cache.clear();
        inner.closed = true;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;
    use crate::Metadata;

    #[test]
    fn test_basic_append_and_read() {
        let dir = tempdir().unwrap();
        let mut md = Metadata::new();
        md.put_int("mkey1", 1);

        let a = MultiAppendable::open(
            dir.path().join("logs"),
            Options::default().with_metadata(md.to_bytes()),
        )
        .unwrap();

        assert_eq!(a.size().unwrap(), 0);
        a.set_offset(0).unwrap();

        let parsed = Metadata::from_bytes(&a.metadata()).unwrap();
        assert_eq!(parsed.get_int("mkey1"), Some(1));

        assert_eq!(a.append(&[]).unwrap(), (0, 0));
        assert_eq!(a.append(&[1, 2, 3]).unwrap(), (0, 3));
        assert_eq!(a.append(&[4, 5, 6, 7, 8, 9, 10]).unwrap(), (3, 7));

        a.flush().unwrap();

        let mut bs = [0u8; 3];
        a.read_at(&mut bs, 0).unwrap();
        assert_eq!(bs, [1, 2, 3]);

        let mut bs = [0u8; 4];
        a.read_at(&mut bs, 6).unwrap();
        assert_eq!(bs, [7, 8, 9, 10]);

        a.sync().unwrap();
        a.close().unwrap();
    }

    #[test]
    fn test_reopening_with_tiny_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs");
        {
            let a =
                MultiAppendable::open(&path, Options::default().with_file_size(1)).unwrap();
            assert_eq!(a.append(&[1, 2]).unwrap(), (0, 2));
            assert_eq!(a.append(&[3]).unwrap(), (2, 1));
            a.close().unwrap();
        }

        let a = MultiAppendable::open(&path, Options::default().with_read_only(true)).unwrap();
        assert_eq!(a.size().unwrap(), 3);

        let mut bs = [0u8; 3];
        assert_eq!(a.read_at(&mut bs, 0).unwrap(), 3);
        assert_eq!(bs, [1, 2, 3]);

        assert!(matches!(a.append(&[]), Err(Error::ReadOnly)));
        assert!(matches!(a.flush(), Err(Error::ReadOnly)));
        assert!(matches!(a.sync(), Err(Error::ReadOnly)));

        a.close().unwrap();
    }

    #[test]
    fn test_edge_cases() {
        let dir = tempdir().unwrap();

        // Not a directory.
        let file_path = dir.path().join("plain_file");
        std::fs::write(&file_path, b"x").unwrap();
        assert!(matches!(
            MultiAppendable::open(&file_path, Options::default()),
            Err(Error::PathIsNotADirectory { .. })
        ));

        // Read-only open of a missing directory.
        assert!(MultiAppendable::open(
            dir.path().join("missing"),
            Options::default().with_read_only(true)
        )
        .is_err());

        let a = MultiAppendable::open(dir.path().join("logs"), Options::default()).unwrap();
        assert!(matches!(a.read_at(&mut [], 0), Err(Error::IllegalArguments { .. })));

        a.close().unwrap();
        assert!(matches!(a.size(), Err(Error::AlreadyClosed)));
        assert!(matches!(a.set_offset(0), Err(Error::AlreadyClosed)));
        assert!(matches!(a.append(&[]), Err(Error::AlreadyClosed)));
        assert!(matches!(a.flush(), Err(Error::AlreadyClosed)));
        assert!(matches!(a.sync(), Err(Error::AlreadyClosed)));
        assert!(matches!(a.close(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_spanning_reads_through_lru() {
        let dir = tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).collect();

        let a = MultiAppendable::open(
            dir.path().join("logs"),
            Options::default().with_file_size(16).with_max_opened_files(3),
        )
        .unwrap();
        a.append(&data).unwrap();
        a.flush().unwrap();

        // 256 bytes over 16-byte files: reads cross many files with only 3
        // handles cached.
        let mut bs = vec![0u8; 256];
        assert_eq!(a.read_at(&mut bs, 0).unwrap(), 256);
        assert_eq!(bs, data);

        let mut bs = [0u8; 40];
        assert_eq!(a.read_at(&mut bs, 20).unwrap(), 40);
        assert_eq!(&bs[..], &data[20..60]);

        a.close().unwrap();
    }

    #[test]
    fn test_compression_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs");
        {
            let a = MultiAppendable::open(
                &path,
                Options::default().with_compression_format(CompressionFormat::Zlib),
            )
            .unwrap();
            assert_eq!(a.append(&[1, 2, 3]).unwrap().0, 0);
            a.flush().unwrap();

            let mut bs = [0u8; 3];
            a.read_at(&mut bs, 0).unwrap();
            assert_eq!(bs, [1, 2, 3]);
            a.close().unwrap();
        }

        let a = MultiAppendable::open(&path, Options::default().with_read_only(true)).unwrap();
        let mut bs = [0u8; 3];
        a.read_at(&mut bs, 0).unwrap();
        assert_eq!(bs, [1, 2, 3]);
    }

    #[test]
    fn test_set_offset_across_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs");
        let a = MultiAppendable::open(&path, Options::default().with_file_size(4)).unwrap();
        a.append(&(0..20u8).collect::<Vec<_>>()).unwrap();
        a.flush().unwrap();
        assert_eq!(a.size().unwrap(), 20);

        a.set_offset(6).unwrap();
        assert_eq!(a.size().unwrap(), 6);

        assert_eq!(a.append(&[99]).unwrap().0, 6);
        a.flush().unwrap();

        let mut bs = [0u8; 7];
        assert_eq!(a.read_at(&mut bs, 0).unwrap(), 7);
        assert_eq!(bs, [0, 1, 2, 3, 4, 5, 99]);

        a.close().unwrap();

        let a = MultiAppendable::open(&path, Options::default().with_file_size(4)).unwrap();
        assert_eq!(a.size().unwrap(), 7);
    }

    #[test]
    fn test_options_accessors() {
        let opts = Options::default()
            .with_read_only(true)
            .with_file_mode(0o600)
            .with_file_size(DEFAULT_FILE_SIZE)
            .with_file_ext("val")
            .with_max_opened_files(DEFAULT_MAX_OPENED_FILES)
            .with_compression_format(CompressionFormat::Gzip)
            .with_compression_level(3)
            .with_metadata(vec![1, 2, 3, 4]);

        assert!(opts.read_only);
        assert_eq!(opts.file_mode, 0o600);
        assert_eq!(opts.file_size, DEFAULT_FILE_SIZE);
        assert_eq!(opts.file_ext, "val");
        assert_eq!(opts.max_opened_files, DEFAULT_MAX_OPENED_FILES);
        assert_eq!(opts.compression_format, CompressionFormat::Gzip);
        assert_eq!(opts.compression_level, 3);
        assert_eq!(opts.metadata, vec![1, 2, 3, 4]);
    }
}
