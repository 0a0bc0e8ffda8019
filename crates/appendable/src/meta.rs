//! The metadata blob stored in every log header.
//!
//! A small binary map of string keys to signed 64-bit values, serialized
//! big-endian. The store records its creation-time limits here (file size,
//! entry and length caps) so a reopen decodes with the original bounds.

use std::collections::BTreeMap;

/// Binary key/value metadata map.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: BTreeMap<String, i64>,
}

impl Metadata {
    /// Creates an empty metadata map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a metadata blob. Returns `None` for malformed input.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let mut entries = BTreeMap::new();
        if data.is_empty() {
            return Some(Self { entries });
        }

        let count = u32::from_be_bytes(data.get(0..4)?.try_into().ok()?) as usize;
        let mut pos = 4;

        for _ in 0..count {
            let klen = u32::from_be_bytes(data.get(pos..pos + 4)?.try_into().ok()?) as usize;
            pos += 4;
            let key = std::str::from_utf8(data.get(pos..pos + klen)?).ok()?.to_string();
            pos += klen;
            let value = i64::from_be_bytes(data.get(pos..pos + 8)?.try_into().ok()?);
            pos += 8;
            entries.insert(key, value);
        }

        Some(Self { entries })
    }

    /// Sets an integer value.
    pub fn put_int(&mut self, key: &str, value: i64) -> &mut Self {
        self.entries.insert(key.to_string(), value);
        self
    }

    /// Reads an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.entries.get(key).copied()
    }

    /// Serializes the map.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(self.entries.len() as u32).to_be_bytes());
        for (key, value) in &self.entries {
            buf.extend_from_slice(&(key.len() as u32).to_be_bytes());
            buf.extend_from_slice(key.as_bytes());
            buf.extend_from_slice(&value.to_be_bytes());
        }
        buf
    }
}
