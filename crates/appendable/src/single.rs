//! Single-file append-only log with buffered writes and optional per-chunk
//! compression.
//!
//! On-disk layout:
//!
//! ```text
//! [u8 version][u8 compression format][i32 BE compression level]
//! [u32 BE metadata len][metadata bytes]
//! <data region>
//! ```
//!
//! With `CompressionFormat::None` the data region is the raw logical stream
//! and `read_at` is a direct positional read. With any other format the data
//! region is a sequence of framed chunks
//! `[u32 BE physical len][u32 BE logical len][compressed payload]`; an
//! in-memory chunk index built by scanning the file on open maps logical
//! offsets to chunks, and reads may span chunk boundaries.
//!
//! Appends land in a bounded in-memory buffer first; a full buffer spills to
//! disk (as one chunk when compressing). Reads of the still-buffered suffix
//! are served from memory under the same mutex that guards appends.

#[cfg(unix)]
use std::os::unix::fs::FileExt;
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
#[cfg(windows)]
use std::os::windows::fs::FileExt;
use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    compression::{compress, decompress, CompressionFormat, DEFAULT_COMPRESSION_LEVEL},
    error::{Error, Result},
    Appendable,
};

/// Default in-memory write buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Default POSIX mode for newly created files.
pub const DEFAULT_FILE_MODE: u32 = 0o755;

const FORMAT_VERSION: u8 = 1;

/// Options for opening a [`FileAppendable`].
#[derive(Debug, Clone)]
pub struct Options {
    /// Reject all mutators.
    pub read_only: bool,
    /// POSIX mode for newly created files.
    pub file_mode: u32,
    /// Chunk compression format for newly created files.
    pub compression_format: CompressionFormat,
    /// Codec-specific level; negative selects the codec default.
    pub compression_level: i32,
    /// In-memory write buffer size (and chunk granularity when compressing).
    pub buffer_size: usize,
    /// Caller metadata stored verbatim in the header of new files.
    pub metadata: Vec<u8>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            read_only: false,
            file_mode: DEFAULT_FILE_MODE,
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

    /// Sets the write buffer size.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Sets the caller metadata blob for new files.
    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Index entry for one compressed chunk.
#[derive(Debug, Clone, Copy)]
struct Chunk {
    logical_off: u64,
    logical_len: u32,
    phys_off: u64,
    phys_len: u32,
}

struct Inner {
    file: File,
    read_only: bool,
    closed: bool,
    format: CompressionFormat,
    level: i32,
    metadata: Vec<u8>,
    header_len: u64,
    /// Buffered logical tail: spans `[flushed_off, w_off)`.
    buf: Vec<u8>,
    buf_cap: usize,
    /// Logical size including buffered bytes.
    w_off: u64,
    /// Logical bytes persisted to the file.
    flushed_off: u64,
    /// Physical end of the data region (compressed streams only; for raw
    /// streams the physical end is `header_len + flushed_off`).
    phys_end: u64,
    /// Chunk index, compressed streams only, sorted by logical offset.
    chunks: Vec<Chunk>,
}

/// Single-file append-only log.
pub struct FileAppendable {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl FileAppendable {
    /// Opens or creates the log at `path`.
    ///
    /// An existing file is self-describing: its header supplies compression
    /// settings and metadata, and `opts` only contributes `read_only`,
    /// `file_mode` and `buffer_size`.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if path.is_dir() {
            return Err(Error::IllegalArguments { what: format!("path: {}", path.display()) });
        }

        if path.exists() {
            Self::open_existing(path, opts)
        } else {
            Self::create(path, opts)
        }
    }

    fn create(path: PathBuf, opts: Options) -> Result<Self> {
        if opts.read_only {
            return Err(Error::Io {
                source: std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("read-only open of missing file {}", path.display()),
                ),
            });
        }
        if opts.buffer_size == 0 {
            return Err(Error::IllegalArguments { what: "buffer_size".to_string() });
        }

        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true).create_new(true);
        #[cfg(unix)]
        open_opts.mode(opts.file_mode);
        let file = open_opts.open(&path)?;

        let mut header = Vec::with_capacity(10 + opts.metadata.len());
        header.push(FORMAT_VERSION);
        header.push(opts.compression_format.as_u8());
        header.extend_from_slice(&opts.compression_level.to_be_bytes());
        header.extend_from_slice(&(opts.metadata.len() as u32).to_be_bytes());
        header.extend_from_slice(&opts.metadata);

        write_all_at_offset(&file, &header, 0)?;

        let header_len = header.len() as u64;
        Ok(Self {
            path,
            inner: Mutex::new(Inner {
                file,
                read_only: false,
                closed: false,
                format: opts.compression_format,
                level: opts.compression_level,
                metadata: opts.metadata,
                header_len,
                buf: Vec::with_capacity(opts.buffer_size),
                buf_cap: opts.buffer_size,
                w_off: 0,
                flushed_off: 0,
                phys_end: header_len,
                chunks: Vec::new(),
            }),
        })
    }

    fn open_existing(path: PathBuf, opts: Options) -> Result<Self> {
        if opts.buffer_size == 0 {
            return Err(Error::IllegalArguments { what: "buffer_size".to_string() });
        }

        let file = if opts.read_only {
            OpenOptions::new().read(true).open(&path)?
        } else {
            OpenOptions::new().read(true).write(true).open(&path)?
        };
        let phys_size = file.metadata()?.len();

        let mut fixed = [0u8; 10];
        read_exact_at_offset(&file, &mut fixed, 0)
            .map_err(|_| Error::Corrupted { reason: "truncated header".to_string() })?;

        if fixed[0] != FORMAT_VERSION {
            return Err(Error::Corrupted { reason: format!("unsupported version: {}", fixed[0]) });
        }
        let format = CompressionFormat::try_from(fixed[1])?;
        let level = i32::from_be_bytes([fixed[2], fixed[3], fixed[4], fixed[5]]);
        let meta_len = u32::from_be_bytes([fixed[6], fixed[7], fixed[8], fixed[9]]) as u64;

        if 10 + meta_len > phys_size {
            return Err(Error::Corrupted { reason: "metadata extends past file end".to_string() });
        }
        let mut metadata = vec![0u8; meta_len as usize];
        read_exact_at_offset(&file, &mut metadata, 10)?;

        let header_len = 10 + meta_len;

        let mut inner = Inner {
            file,
            read_only: opts.read_only,
            closed: false,
            format,
            level,
            metadata,
            header_len,
            buf: Vec::with_capacity(opts.buffer_size),
            buf_cap: opts.buffer_size,
            w_off: 0,
            flushed_off: 0,
            phys_end: header_len,
            chunks: Vec::new(),
        };

        if format == CompressionFormat::None {
            inner.flushed_off = phys_size - header_len;
            inner.w_off = inner.flushed_off;
            inner.phys_end = phys_size;
        } else {
            // Rebuild the chunk index; a torn trailing chunk is discarded.
            let mut pos = header_len;
            let mut logical = 0u64;
            while pos + 8 <= phys_size {
                let mut frame = [0u8; 8];
                read_exact_at_offset(&inner.file, &mut frame, pos)?;
                let phys_len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                let logical_len = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);
                if pos + 8 + phys_len as u64 > phys_size {
                    break;
                }
                inner.chunks.push(Chunk {
                    logical_off: logical,
                    logical_len,
                    phys_off: pos,
                    phys_len,
                });
                logical += logical_len as u64;
                pos += 8 + phys_len as u64;
            }
            if pos < phys_size {
                warn!(
                    path = %path.display(),
                    discarded = phys_size - pos,
                    "discarding torn trailing chunk"
                );
                if !opts.read_only {
                    inner.file.set_len(pos)?;
                }
            }
            inner.flushed_off = logical;
            inner.w_off = logical;
            inner.phys_end = pos;
        }

        Ok(Self { path, inner: Mutex::new(inner) })
    }

    /// Path this log was opened at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The compression format recorded in the header.
    pub fn compression_format(&self) -> CompressionFormat {
        self.inner.lock().format
    }

    /// The compression level recorded in the header.
    pub fn compression_level(&self) -> i32 {
        self.inner.lock().level
    }

    fn check_open(inner: &Inner) -> Result<()> {
        if inner.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(())
    }

    fn check_writable(inner: &Inner) -> Result<()> {
        Self::check_open(inner)?;
        if inner.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

impl Inner {
    /// Writes `data` straight to the data region past the flushed watermark.
    /// Raw streams only.
    fn write_through(&mut self, data: &[u8]) -> Result<()> {
        debug_assert_eq!(self.format, CompressionFormat::None);
        write_all_at_offset(&self.file, data, self.header_len + self.flushed_off)?;
        self.flushed_off += data.len() as u64;
        self.phys_end = self.header_len + self.flushed_off;
        Ok(())
    }

    /// Compresses and frames `len` bytes from the front of the buffer.
    fn emit_chunk(&mut self, len: usize) -> Result<()> {
        debug_assert!(len > 0 && len <= self.buf.len());
        let payload = compress(self.format, self.level, &self.buf[..len])?;

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(len as u32).to_be_bytes());
        frame.extend_from_slice(&payload);
        write_all_at_offset(&self.file, &frame, self.phys_end)?;

        self.chunks.push(Chunk {
            logical_off: self.flushed_off,
            logical_len: len as u32,
            phys_off: self.phys_end,
            phys_len: payload.len() as u32,
        });
        self.phys_end += frame.len() as u64;
        self.flushed_off += len as u64;
        self.buf.drain(..len);
        Ok(())
    }

    fn flush_buf(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        if self.format == CompressionFormat::None {
            let pending = std::mem::take(&mut self.buf);
            self.write_through(&pending)?;
            self.buf = pending;
            self.buf.clear();
        } else {
            let len = self.buf.len();
            self.emit_chunk(len)?;
        }
        Ok(())
    }

    /// Copies flushed bytes at logical `off` into `dst`, returning the count.
    fn read_flushed(&self, dst: &mut [u8], off: u64) -> Result<usize> {
        debug_assert!(off < self.flushed_off);
        let want = dst.len().min((self.flushed_off - off) as usize);

        if self.format == CompressionFormat::None {
            read_exact_at_offset(&self.file, &mut dst[..want], self.header_len + off)?;
            return Ok(want);
        }

        // First chunk whose range contains `off`.
        let mut idx = self
            .chunks
            .partition_point(|c| c.logical_off + c.logical_len as u64 <= off);
        let mut done = 0;
        let mut pos = off;
        while done < want {
            let chunk = self.chunks[idx];
            let mut payload = vec![0u8; chunk.phys_len as usize];
            read_exact_at_offset(&self.file, &mut payload, chunk.phys_off + 8)?;
            let plain = decompress(self.format, &payload, chunk.logical_len as usize)?;

            let start = (pos - chunk.logical_off) as usize;
            let take = (want - done).min(plain.len() - start);
            dst[done..done + take].copy_from_slice(&plain[start..start + take]);
            done += take;
            pos += take as u64;
            idx += 1;
        }
        Ok(want)
    }
}

impl Appendable for FileAppendable {
    fn metadata(&self) -> Vec<u8> {
        self.inner.lock().metadata.clone()
    }

    fn size(&self) -> Result<u64> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;
        Ok(inner.w_off)
    }

    fn append(&self, data: &[u8]) -> Result<(u64, usize)> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        let off = inner.w_off;
        if data.is_empty() {
            return Ok((off, 0));
        }

        if inner.format == CompressionFormat::None
            && inner.buf.is_empty()
            && data.len() >= inner.buf_cap
        {
            // Large append with nothing buffered: skip the copy.
            inner.write_through(data)?;
        } else {
            inner.buf.extend_from_slice(data);
            while inner.buf.len() >= inner.buf_cap {
                if inner.format == CompressionFormat::None {
                    inner.flush_buf()?;
                } else {
                    let len = inner.buf_cap;
                    inner.emit_chunk(len)?;
                }
            }
        }

        inner.w_off = off + data.len() as u64;
        Ok((off, data.len()))
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let inner = self.inner.lock();
        Self::check_open(&inner)?;

        if buf.is_empty() {
            return Err(Error::IllegalArguments { what: "buffer".to_string() });
        }
        if offset > inner.w_off {
            return Err(Error::IllegalArguments { what: "offset".to_string() });
        }

        let mut done = 0;
        if offset < inner.flushed_off {
            done = inner.read_flushed(buf, offset)?;
        }

        // Serve the still-buffered suffix.
        let pos = offset + done as u64;
        if done < buf.len() && pos >= inner.flushed_off && pos < inner.w_off {
            let start = (pos - inner.flushed_off) as usize;
            let take = (buf.len() - done).min(inner.buf.len() - start);
            buf[done..done + take].copy_from_slice(&inner.buf[start..start + take]);
            done += take;
        }

        Ok(done)
    }

    fn set_offset(&self, offset: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;

        if offset > inner.w_off {
            return Err(Error::IllegalArguments { what: "offset".to_string() });
        }
        if offset == inner.w_off {
            return Ok(());
        }

        if offset >= inner.flushed_off {
            // Discard buffered tail only.
            let keep = (offset - inner.flushed_off) as usize;
            inner.buf.truncate(keep);
            inner.w_off = offset;
            return Ok(());
        }

        if inner.format != CompressionFormat::None {
            // Truncating into already-compressed chunks would require
            // rewriting a chunk; compressed logs only drop buffered bytes.
            return Err(Error::IllegalArguments { what: "offset".to_string() });
        }

        inner.file.set_len(inner.header_len + offset)?;
        inner.buf.clear();
        inner.flushed_off = offset;
        inner.w_off = offset;
        inner.phys_end = inner.header_len + offset;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.flush_buf()
    }

    fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_writable(&inner)?;
        inner.flush_buf()?;
        inner.file.sync_data()?;
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        Self::check_open(&inner)?;
        if !inner.read_only {
            inner.flush_buf()?;
            inner.file.sync_data()?;
        }
        inner.closed = true;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Platform-specific position-based I/O helpers
// ---------------------------------------------------------------------------

#[cfg(unix)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    file.read_exact_at(buf, offset)?;
    Ok(())
}

#[cfg(windows)]
fn read_exact_at_offset(file: &File, buf: &mut [u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < buf.len() {
        let n = file.seek_read(&mut buf[pos..], offset + pos as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "unexpected end of file during seek_read",
            )
            .into());
        }
        pos += n;
    }
    Ok(())
}

#[cfg(unix)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    file.write_all_at(data, offset)?;
    Ok(())
}

#[cfg(windows)]
fn write_all_at_offset(file: &File, data: &[u8], offset: u64) -> Result<()> {
    let mut pos = 0;
    while pos < data.len() {
        let n = file.seek_write(&data[pos..], offset + pos as u64)?;
        pos += n;
    }
    Ok(())
}
