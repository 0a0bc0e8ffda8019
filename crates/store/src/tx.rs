//! Transaction model and record codec.
//!
//! A transaction-log record is framed by its commit-log entry and encodes,
//! all big-endian:
//!
//! ```text
//! [u64 id][i64 ts][u64 bl_tx_id][32 bl_root][u32 nentries]
//! per entry: [u32 key_len][key][u32 value_len][u64 v_off][32 h_value]
//! ```
//!
//! `eh` (the Merkle root over entry digests) and the accumulated hash are
//! derived on read, not stored. The top byte of `v_off` selects the value
//! log; the low 56 bits are the offset within it.

use quiverdb_types::{sha256_concat, Hash, InclusionProof, MerkleTree};
use sha2::{Digest, Sha256};

use crate::{
    error::{Error, Result},
    proof::TxHeader,
};

/// Fixed size of the record preamble.
pub(crate) const TX_HEADER_SIZE: usize = 8 + 8 + 8 + 32 + 4;

/// Fixed per-entry overhead beyond the key bytes.
pub(crate) const TX_ENTRY_FIXED_SIZE: usize = 4 + 4 + 8 + 32;

/// One key/value pair submitted to `commit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KV {
    /// Key bytes, unique within the batch.
    pub key: Vec<u8>,
    /// Value bytes.
    pub value: Vec<u8>,
}

impl KV {
    /// Convenience constructor.
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Decode-time bounds, adopted from the store's creation-time limits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Caps {
    pub max_tx_entries: u32,
    pub max_key_len: u32,
    pub max_value_len: u32,
}

impl Caps {
    /// Largest possible record under these caps; bounds read buffers.
    pub fn max_record_size(&self) -> u64 {
        TX_HEADER_SIZE as u64
            + self.max_tx_entries as u64 * (TX_ENTRY_FIXED_SIZE as u64 + self.max_key_len as u64)
    }
}

/// One committed entry.
#[derive(Debug, Clone)]
pub struct TxEntry {
    key: Vec<u8>,
    /// Value length in bytes.
    pub value_len: u32,
    /// Tagged value offset: value-log id in the top byte, offset below.
    pub v_off: u64,
    /// SHA-256 of the value bytes.
    pub h_value: Hash,
}

impl TxEntry {
    pub(crate) fn new(key: Vec<u8>, value_len: u32, h_value: Hash) -> Self {
        Self { key, value_len, v_off: 0, h_value }
    }

    /// The entry's key.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Leaf digest in the transaction's Merkle tree:
    /// `SHA-256(key ‖ value_len ‖ h_value)`.
    pub fn digest(&self) -> Hash {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(self.value_len.to_be_bytes());
        hasher.update(self.h_value);
        hasher.finalize().into()
    }

    /// The 44-byte value locator stored in the index:
    /// `value_len ‖ v_off ‖ h_value`.
    pub fn locator(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(44);
        out.extend_from_slice(&self.value_len.to_be_bytes());
        out.extend_from_slice(&self.v_off.to_be_bytes());
        out.extend_from_slice(&self.h_value);
        out
    }
}

/// A committed transaction, decoded from the logs.
///
/// Reusable: `read_tx` and the tx reader repopulate the same allocation.
pub struct Tx {
    /// Transaction id, 1-based and dense.
    pub id: u64,
    /// Commit wall-clock seconds.
    pub ts: i64,
    /// Last transaction covered by the embedded binary-linking tree.
    pub bl_tx_id: u64,
    /// Root of that tree.
    pub bl_root: Hash,
    /// Accumulated hash of the previous transaction.
    pub prev_alh: Hash,
    entries: Vec<TxEntry>,
    eh: Hash,
    htree: Option<MerkleTree>,
}

impl Default for Tx {
    fn default() -> Self {
        Self::new()
    }
}

impl Tx {
    /// An empty transaction buffer.
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    /// An empty transaction buffer with entry capacity reserved.
    pub fn with_capacity(nentries: usize) -> Self {
        Self {
            id: 0,
            ts: 0,
            bl_tx_id: 0,
            bl_root: [0; 32],
            prev_alh: [0; 32],
            entries: Vec::with_capacity(nentries),
            eh: [0; 32],
            htree: None,
        }
    }

    /// Entries in key order.
    pub fn entries(&self) -> &[TxEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn nentries(&self) -> u32 {
        self.entries.len() as u32
    }

    /// Merkle root over the entry digests.
    pub fn eh(&self) -> Hash {
        self.eh
    }

    /// The header commitment fields.
    pub fn header(&self) -> TxHeader {
        TxHeader {
            id: self.id,
            ts: self.ts,
            bl_tx_id: self.bl_tx_id,
            bl_root: self.bl_root,
            nentries: self.nentries(),
            eh: self.eh,
            prev_alh: self.prev_alh,
        }
    }

    /// Commitment to the header fields plus the Merkle root.
    pub fn inner_hash(&self) -> Hash {
        self.header().inner_hash()
    }

    /// Accumulated hash: `SHA-256(prev_alh ‖ inner_hash)`.
    pub fn alh(&self) -> Hash {
        sha256_concat(&[self.prev_alh, self.inner_hash()])
    }

    /// Inclusion proof for the entry at `index` against `eh`.
    pub fn proof(&self, index: usize) -> Option<InclusionProof> {
        self.htree.as_ref().and_then(|t| t.proof(index))
    }

    /// Index of `key` among the key-sorted entries.
    pub fn index_of(&self, key: &[u8]) -> Option<usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key)).ok()
    }

    /// Decodes a full record, rebuilding the entry Merkle tree.
    pub(crate) fn decode(&mut self, data: &[u8], caps: &Caps) -> Result<()> {
        let corrupt = |tx_id| Error::CorruptedTxData { tx_id };

        if data.len() < TX_HEADER_SIZE {
            return Err(corrupt(0));
        }
        self.id = u64::from_be_bytes(data[0..8].try_into().expect("8 bytes"));
        self.ts = i64::from_be_bytes(data[8..16].try_into().expect("8 bytes"));
        self.bl_tx_id = u64::from_be_bytes(data[16..24].try_into().expect("8 bytes"));
        self.bl_root.copy_from_slice(&data[24..56]);
        let nentries = u32::from_be_bytes(data[56..60].try_into().expect("4 bytes"));

        if nentries == 0 || nentries > caps.max_tx_entries {
            return Err(corrupt(self.id));
        }

        self.entries.clear();
        let mut pos = TX_HEADER_SIZE;
        for _ in 0..nentries {
            if data.len() < pos + 4 {
                return Err(corrupt(self.id));
            }
            let key_len =
                u32::from_be_bytes(data[pos..pos + 4].try_into().expect("4 bytes")) as usize;
            pos += 4;
            if key_len == 0
                || key_len > caps.max_key_len as usize
                || data.len() < pos + key_len + 44
            {
                return Err(corrupt(self.id));
            }
            let key = data[pos..pos + key_len].to_vec();
            pos += key_len;
            let value_len = u32::from_be_bytes(data[pos..pos + 4].try_into().expect("4 bytes"));
            pos += 4;
            if value_len > caps.max_value_len {
                return Err(corrupt(self.id));
            }
            let v_off = u64::from_be_bytes(data[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            let mut h_value: Hash = [0; 32];
            h_value.copy_from_slice(&data[pos..pos + 32]);
            pos += 32;

            let mut entry = TxEntry::new(key, value_len, h_value);
            entry.v_off = v_off;
            self.entries.push(entry);
        }
        if pos != data.len() {
            return Err(corrupt(self.id));
        }

        // Keys must arrive sorted and unique; the record is rejected
        // otherwise rather than silently re-sorted.
        for pair in self.entries.windows(2) {
            if pair[0].key >= pair[1].key {
                return Err(corrupt(self.id));
            }
        }

        self.build_hash_tree();
        self.prev_alh = [0; 32];
        Ok(())
    }

    pub(crate) fn build_hash_tree(&mut self) {
        let leaves: Vec<Hash> = self.entries.iter().map(TxEntry::digest).collect();
        let tree = MerkleTree::from_leaves(&leaves);
        self.eh = tree.root();
        self.htree = Some(tree);
    }
}

/// Encodes the record preamble.
pub(crate) fn encode_header(
    out: &mut Vec<u8>,
    id: u64,
    ts: i64,
    bl_tx_id: u64,
    bl_root: Hash,
    nentries: u32,
) {
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&ts.to_be_bytes());
    out.extend_from_slice(&bl_tx_id.to_be_bytes());
    out.extend_from_slice(&bl_root);
    out.extend_from_slice(&nentries.to_be_bytes());
}

/// Encodes the entry section.
pub(crate) fn encode_entries(entries: &[TxEntry]) -> Vec<u8> {
    let size: usize =
        entries.iter().map(|e| TX_ENTRY_FIXED_SIZE + e.key().len()).sum();
    let mut out = Vec::with_capacity(size);
    for e in entries {
        out.extend_from_slice(&(e.key().len() as u32).to_be_bytes());
        out.extend_from_slice(e.key());
        out.extend_from_slice(&e.value_len.to_be_bytes());
        out.extend_from_slice(&e.v_off.to_be_bytes());
        out.extend_from_slice(&e.h_value);
    }
    out
}

/// Splits a tagged value offset into `(value log id, offset)`.
pub(crate) fn split_v_off(v_off: u64) -> (usize, u64) {
    ((v_off >> 56) as usize, v_off & ((1u64 << 56) - 1))
}

/// Builds a tagged value offset.
pub(crate) fn join_v_off(log_id: usize, off: u64) -> u64 {
    debug_assert!(off < (1u64 << 56));
    ((log_id as u64) << 56) | off
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use quiverdb_types::sha256;

    use super::*;

    fn caps() -> Caps {
        Caps { max_tx_entries: 1024, max_key_len: 1024, max_value_len: 4096 }
    }

    fn sample_entries() -> Vec<TxEntry> {
        (0u64..5)
            .map(|i| {
                let mut e = TxEntry::new(
                    i.to_be_bytes().to_vec(),
                    8,
                    sha256(&(i + 100).to_be_bytes()),
                );
                e.v_off = join_v_off(0, i * 8);
                e
            })
            .collect()
    }

    fn encode_record(entries: &[TxEntry]) -> Vec<u8> {
        let mut rec = Vec::new();
        encode_header(&mut rec, 3, 1_700_000_000, 2, sha256(b"blroot"), entries.len() as u32);
        rec.extend_from_slice(&encode_entries(entries));
        rec
    }

    #[test]
    fn test_record_roundtrip() {
        let entries = sample_entries();
        let rec = encode_record(&entries);

        let mut tx = Tx::new();
        tx.decode(&rec, &caps()).unwrap();

        assert_eq!(tx.id, 3);
        assert_eq!(tx.ts, 1_700_000_000);
        assert_eq!(tx.bl_tx_id, 2);
        assert_eq!(tx.bl_root, sha256(b"blroot"));
        assert_eq!(tx.nentries(), 5);
        for (got, want) in tx.entries().iter().zip(&entries) {
            assert_eq!(got.key(), want.key());
            assert_eq!(got.value_len, want.value_len);
            assert_eq!(got.v_off, want.v_off);
            assert_eq!(got.h_value, want.h_value);
        }
    }

    #[test]
    fn test_eh_matches_manual_merkle() {
        let entries = sample_entries();
        let rec = encode_record(&entries);

        let mut tx = Tx::new();
        tx.decode(&rec, &caps()).unwrap();

        let leaves: Vec<Hash> = entries.iter().map(TxEntry::digest).collect();
        assert_eq!(tx.eh(), MerkleTree::from_leaves(&leaves).root());

        // Every entry proof verifies against eh.
        for (i, e) in tx.entries().iter().enumerate() {
            let proof = tx.proof(i).unwrap();
            assert!(proof.verify(e.digest(), tx.eh()));
        }
        assert!(tx.proof(5).is_none());
    }

    #[test]
    fn test_alh_chains_prev() {
        let rec = encode_record(&sample_entries());
        let mut tx = Tx::new();
        tx.decode(&rec, &caps()).unwrap();

        tx.prev_alh = sha256(b"prev");
        assert_eq!(tx.alh(), sha256_concat(&[sha256(b"prev"), tx.inner_hash()]));
    }

    #[test]
    fn test_truncated_record_rejected() {
        let rec = encode_record(&sample_entries());
        let mut tx = Tx::new();
        assert!(matches!(
            tx.decode(&rec[..rec.len() - 1], &caps()),
            Err(Error::CorruptedTxData { .. })
        ));
        assert!(matches!(tx.decode(&rec[..10], &caps()), Err(Error::CorruptedTxData { .. })));
    }

    #[test]
    fn test_unsorted_keys_rejected() {
        let mut entries = sample_entries();
        entries.swap(0, 1);
        let rec = encode_record(&entries);
        let mut tx = Tx::new();
        assert!(matches!(tx.decode(&rec, &caps()), Err(Error::CorruptedTxData { .. })));
    }

    #[test]
    fn test_caps_enforced() {
        let entries = sample_entries();
        let rec = encode_record(&entries);
        let mut tx = Tx::new();
        let tight = Caps { max_tx_entries: 2, ..caps() };
        assert!(matches!(tx.decode(&rec, &tight), Err(Error::CorruptedTxData { .. })));
    }

    #[test]
    fn test_index_of() {
        let rec = encode_record(&sample_entries());
        let mut tx = Tx::new();
        tx.decode(&rec, &caps()).unwrap();

        assert_eq!(tx.index_of(&2u64.to_be_bytes()), Some(2));
        assert_eq!(tx.index_of(b"nope"), None);
    }

    #[test]
    fn test_v_off_tagging() {
        let v = join_v_off(3, 1_000_000);
        assert_eq!(split_v_off(v), (3, 1_000_000));
        assert_eq!(split_v_off(join_v_off(0, 0)), (0, 0));
    }

    #[test]
    fn test_locator_layout() {
        let entries = sample_entries();
        let loc = entries[1].locator();
        assert_eq!(loc.len(), 44);
        assert_eq!(u32::from_be_bytes(loc[0..4].try_into().unwrap()), 8);
        assert_eq!(u64::from_be_bytes(loc[4..12].try_into().unwrap()), entries[1].v_off);
        assert_eq!(&loc[12..], &entries[1].h_value);
    }
}
