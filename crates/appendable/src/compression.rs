//! Chunk compression codecs.

use std::io::{Read, Write};

use crate::error::{Error, Result};

/// Selects the codec default level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = -1;

/// Per-chunk compression format for an appendable log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionFormat {
    /// Raw bytes, direct positional reads.
    #[default]
    None = 0,
    /// DEFLATE without wrapper.
    Flate = 1,
    /// gzip wrapper.
    Gzip = 2,
    /// zlib wrapper.
    Zlib = 3,
    /// Zstandard.
    Zstd = 4,
}

impl CompressionFormat {
    /// Format tag persisted in the file header.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CompressionFormat {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Flate),
            2 => Ok(Self::Gzip),
            3 => Ok(Self::Zlib),
            4 => Ok(Self::Zstd),
            _ => Err(Error::Corrupted { reason: format!("invalid compression format: {value}") }),
        }
    }
}

fn flate2_level(level: i32) -> flate2::Compression {
    if level < 0 {
        flate2::Compression::default()
    } else {
        flate2::Compression::new((level as u32).min(9))
    }
}

/// Compresses one chunk. `CompressionFormat::None` is the caller's concern;
/// calling it here returns the input copied.
pub(crate) fn compress(format: CompressionFormat, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match format {
        CompressionFormat::None => Ok(data.to_vec()),
        CompressionFormat::Flate => {
            let mut enc = flate2::write::DeflateEncoder::new(Vec::new(), flate2_level(level));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CompressionFormat::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2_level(level));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CompressionFormat::Zlib => {
            let mut enc = flate2::write::ZlibEncoder::new(Vec::new(), flate2_level(level));
            enc.write_all(data)?;
            Ok(enc.finish()?)
        }
        CompressionFormat::Zstd => {
            let level = if level < 0 { 0 } else { level };
            Ok(zstd::bulk::compress(data, level)?)
        }
    }
}

/// Decompresses one chunk whose uncompressed length is known from the chunk
/// frame.
pub(crate) fn decompress(
    format: CompressionFormat,
    data: &[u8],
    uncompressed_len: usize,
) -> Result<Vec<u8>> {
    let out = match format {
        CompressionFormat::None => data.to_vec(),
        CompressionFormat::Flate => {
            let mut out = Vec::with_capacity(uncompressed_len);
            flate2::read::DeflateDecoder::new(data).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Gzip => {
            let mut out = Vec::with_capacity(uncompressed_len);
            flate2::read::GzDecoder::new(data).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Zlib => {
            let mut out = Vec::with_capacity(uncompressed_len);
            flate2::read::ZlibDecoder::new(data).read_to_end(&mut out)?;
            out
        }
        CompressionFormat::Zstd => zstd::bulk::decompress(data, uncompressed_len)?,
    };

    if out.len() != uncompressed_len {
        return Err(Error::Corrupted {
            reason: format!(
                "chunk decompressed to {} bytes, frame says {}",
                out.len(),
                uncompressed_len
            ),
        });
    }
    Ok(out)
}
