//! Immutable point-in-time views of the tree.

use std::sync::Arc;

use crate::{
    error::{Error, Result},
    node::NodeRef,
    tree::TreeInner,
};

/// A read-only view of the index as of a specific transaction id.
///
/// Holding a snapshot pins every in-memory node reachable from its root (via
/// `Arc` reference counts); frozen nodes are addressed by offset and remain
/// readable regardless. Snapshots never block the writer or each other.
pub struct Snapshot {
    inner: Arc<TreeInner>,
    root: Option<NodeRef>,
    ts: u64,
    closed: bool,
}

impl Snapshot {
    pub(crate) fn new(inner: Arc<TreeInner>, root: Option<NodeRef>, ts: u64) -> Self {
        Self { inner, root, ts, closed: false }
    }

    /// The last transaction id integrated when this snapshot was taken.
    pub fn ts(&self) -> u64 {
        self.ts
    }

    /// Latest value and writing transaction id for `key`.
    pub fn get(&self, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.inner.lookup(&self.root, key)
    }

    /// Up to `limit` transaction ids that wrote `key`, newest first.
    pub fn get_ts(&self, key: &[u8], limit: usize) -> Result<Vec<u64>> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.inner.lookup_history(&self.root, key, limit)
    }

    /// Releases the snapshot's pins. Further reads fail.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.root = None;
        self.closed = true;
        Ok(())
    }
}
