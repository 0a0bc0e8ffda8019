//! Node data model and on-disk page encoding.
//!
//! Two node kinds, tagged on disk like page types:
//!
//! ```text
//! branch: [u8 0x01][u32 nchildren] then per child:
//!         [u32 key_len][max_key][u64 child_off][u32 child_size]
//! leaf:   [u8 0x02][u32 nentries] then per entry:
//!         [u32 key_len][key][u32 value_len][value][u32 nts][u64 ts]...
//! ```
//!
//! All integers big-endian. A branch is only serialized once its children
//! are on disk, so child references in the encoding are always offsets.
//! Leaf `ts` lists are newest-first. `value` holds the latest value only;
//! historical values are read back from the transaction log by ts.

use std::sync::Arc;

use crate::error::{Error, Result};

const TAG_BRANCH: u8 = 1;
const TAG_LEAF: u8 = 2;

/// Reference to a child or root node: resident or frozen on disk.
#[derive(Debug, Clone)]
pub(crate) enum NodeRef {
    /// In-memory node, shared with any snapshot that pinned it.
    Mem(Arc<Node>),
    /// Frozen node in the nodes log.
    Disk {
        /// Logical offset in the nodes log.
        off: u64,
        /// Serialized size in bytes.
        size: u32,
    },
}

/// An index node.
#[derive(Debug, Clone)]
pub(crate) enum Node {
    /// Interior node.
    Branch(BranchNode),
    /// Leaf node.
    Leaf(LeafNode),
}

/// Interior node: routing keys plus child references.
#[derive(Debug, Clone, Default)]
pub(crate) struct BranchNode {
    /// Children in key order; `max_key` is the largest key in the subtree.
    pub children: Vec<ChildRef>,
}

/// One branch slot.
#[derive(Debug, Clone)]
pub(crate) struct ChildRef {
    /// Largest key reachable through `node`.
    pub max_key: Vec<u8>,
    /// The child itself.
    pub node: NodeRef,
}

/// Leaf node: key-ordered entries.
#[derive(Debug, Clone, Default)]
pub(crate) struct LeafNode {
    /// Entries sorted by key.
    pub entries: Vec<LeafEntry>,
}

/// One indexed key.
#[derive(Debug, Clone)]
pub(crate) struct LeafEntry {
    /// The key bytes.
    pub key: Vec<u8>,
    /// Latest value written for the key.
    pub value: Vec<u8>,
    /// Transaction ids that wrote the key, newest first.
    pub tss: Vec<u64>,
}

impl Node {
    /// Largest key in this subtree.
    pub fn max_key(&self) -> &[u8] {
        match self {
            Node::Branch(b) => b.children.last().map_or(&[], |c| c.max_key.as_slice()),
            Node::Leaf(l) => l.entries.last().map_or(&[], |e| e.key.as_slice()),
        }
    }

    /// Serialized size in bytes; drives split decisions.
    pub fn serialized_size(&self) -> usize {
        match self {
            Node::Branch(b) => {
                5 + b
                    .children
                    .iter()
                    .map(|c| 4 + c.max_key.len() + 8 + 4)
                    .sum::<usize>()
            }
            Node::Leaf(l) => {
                5 + l
                    .entries
                    .iter()
                    .map(|e| 4 + e.key.len() + 4 + e.value.len() + 4 + 8 * e.tss.len())
                    .sum::<usize>()
            }
        }
    }

    /// Encodes the node. Branch children must already be on disk.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.serialized_size());
        match self {
            Node::Branch(b) => {
                out.push(TAG_BRANCH);
                out.extend_from_slice(&(b.children.len() as u32).to_be_bytes());
                for child in &b.children {
                    let (off, size) = match child.node {
                        NodeRef::Disk { off, size } => (off, size),
                        NodeRef::Mem(_) => {
                            unreachable!("branch serialized before its children were flushed")
                        }
                    };
                    out.extend_from_slice(&(child.max_key.len() as u32).to_be_bytes());
                    out.extend_from_slice(&child.max_key);
                    out.extend_from_slice(&off.to_be_bytes());
                    out.extend_from_slice(&size.to_be_bytes());
                }
            }
            Node::Leaf(l) => {
                out.push(TAG_LEAF);
                out.extend_from_slice(&(l.entries.len() as u32).to_be_bytes());
                for entry in &l.entries {
                    out.extend_from_slice(&(entry.key.len() as u32).to_be_bytes());
                    out.extend_from_slice(&entry.key);
                    out.extend_from_slice(&(entry.value.len() as u32).to_be_bytes());
                    out.extend_from_slice(&entry.value);
                    out.extend_from_slice(&(entry.tss.len() as u32).to_be_bytes());
                    for ts in &entry.tss {
                        out.extend_from_slice(&ts.to_be_bytes());
                    }
                }
            }
        }
        out
    }

    /// Decodes a node page.
    pub fn deserialize(data: &[u8]) -> Result<Node> {
        let mut r = Reader { data, pos: 0 };
        let tag = r.u8()?;
        match tag {
            TAG_BRANCH => {
                let n = r.u32()? as usize;
                let mut children = Vec::with_capacity(n);
                for _ in 0..n {
                    let klen = r.u32()? as usize;
                    let max_key = r.bytes(klen)?.to_vec();
                    let off = r.u64()?;
                    let size = r.u32()?;
                    children.push(ChildRef { max_key, node: NodeRef::Disk { off, size } });
                }
                Ok(Node::Branch(BranchNode { children }))
            }
            TAG_LEAF => {
                let n = r.u32()? as usize;
                let mut entries = Vec::with_capacity(n);
                for _ in 0..n {
                    let klen = r.u32()? as usize;
                    let key = r.bytes(klen)?.to_vec();
                    let vlen = r.u32()? as usize;
                    let value = r.bytes(vlen)?.to_vec();
                    let nts = r.u32()? as usize;
                    let mut tss = Vec::with_capacity(nts);
                    for _ in 0..nts {
                        tss.push(r.u64()?);
                    }
                    entries.push(LeafEntry { key, value, tss });
                }
                Ok(Node::Leaf(LeafNode { entries }))
            }
            _ => Err(Error::Corrupted { reason: format!("invalid node tag: {tag}") }),
        }
    }
}

impl LeafNode {
    /// Binary search for `key`.
    pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.key.as_slice().cmp(key))
    }
}

impl BranchNode {
    /// Index of the child whose subtree covers `key`: the first child with
    /// `max_key >= key`, or the last child when `key` is beyond every max.
    pub fn child_for(&self, key: &[u8]) -> usize {
        let idx = self.children.partition_point(|c| c.max_key.as_slice() < key);
        idx.min(self.children.len() - 1)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| Error::Corrupted { reason: "truncated node page".to_string() })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().expect("4 bytes")))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.bytes(8)?.try_into().expect("8 bytes")))
    }
}
