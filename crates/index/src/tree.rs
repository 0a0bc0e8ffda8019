//! The copy-on-write B+ tree.
//!
//! Single writer (the store's indexer), many concurrent readers (snapshots).
//! An insert path-copies from the affected leaf up to the root and publishes
//! the new root atomically under the state lock, so a whole transaction
//! becomes visible at once. Flushing freezes the resident subtree bottom-up
//! into the nodes log and records the new root in the root log.

use std::{
    num::NonZeroUsize,
    path::Path,
    sync::Arc,
};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use quiverdb_appendable::{multi, Appendable, MultiAppendable};
use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    node::{BranchNode, ChildRef, LeafEntry, LeafNode, Node, NodeRef},
    snapshot::Snapshot,
};

/// Default cap on a node's serialized size before it splits.
pub const DEFAULT_MAX_NODE_SIZE: usize = 4096;

/// Default capacity of the deserialized-node cache.
pub const DEFAULT_CACHE_SIZE: usize = 256;

/// Root log record: `u64 ts ‖ u64 off ‖ u64 size`.
const ROOT_RECORD_SIZE: u64 = 24;

/// Options for opening a [`Tree`].
#[derive(Debug, Clone)]
pub struct TreeOptions {
    /// Reject all mutators.
    pub read_only: bool,
    /// POSIX mode for newly created files.
    pub file_mode: u32,
    /// Logical bytes per chunk file of the backing logs.
    pub file_size: u64,
    /// Open-handle cap for the backing logs.
    pub max_opened_files: usize,
    /// Serialized-size cap before a node splits.
    pub max_node_size: usize,
    /// Capacity of the deserialized-node cache.
    pub cache_size: usize,
}

impl Default for TreeOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            file_mode: 0o755,
            file_size: multi::DEFAULT_FILE_SIZE,
            max_opened_files: multi::DEFAULT_MAX_OPENED_FILES,
            max_node_size: DEFAULT_MAX_NODE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
        }
    }
}

pub(crate) struct TreeState {
    pub root: Option<NodeRef>,
    pub ts: u64,
    pub closed: bool,
}

pub(crate) struct TreeInner {
    nodes: MultiAppendable,
    roots: MultiAppendable,
    pub(crate) state: RwLock<TreeState>,
    cache: Mutex<LruCache<u64, Arc<Node>>>,
    opts: TreeOptions,
}

/// Durable copy-on-write B+ tree with per-key transaction history.
///
/// Cheap to clone; clones share the same tree.
#[derive(Clone)]
pub struct Tree {
    pub(crate) inner: Arc<TreeInner>,
}

enum Outcome {
    One(NodeRef),
    Split(NodeRef, NodeRef),
}

impl Tree {
    /// Opens or creates a tree under `dir` (`dir/nodes` and `dir/roots`).
    ///
    /// `max_ts` bounds recovery: root records stamped with a later ts are
    /// skipped, which discards index state that outran a lost tail of the
    /// commit log.
    pub fn open(dir: impl AsRef<Path>, opts: TreeOptions, max_ts: u64) -> Result<Tree> {
        if opts.max_node_size < 64 {
            return Err(Error::IllegalArguments { what: "max_node_size".to_string() });
        }
        let cache_cap = NonZeroUsize::new(opts.cache_size)
            .ok_or_else(|| Error::IllegalArguments { what: "cache_size".to_string() })?;

        let dir = dir.as_ref();
        let log_opts = |ext: &str| {
            multi::Options::default()
                .with_read_only(opts.read_only)
                .with_file_mode(opts.file_mode)
                .with_file_size(opts.file_size)
                .with_max_opened_files(opts.max_opened_files)
                .with_file_ext(ext)
        };
        let nodes = MultiAppendable::open(dir.join("nodes"), log_opts("idx"))?;
        let roots = MultiAppendable::open(dir.join("roots"), log_opts("ri"))?;

        // Recover the newest usable root.
        let roots_size = roots.size()?;
        let mut n = roots_size / ROOT_RECORD_SIZE;
        if roots_size % ROOT_RECORD_SIZE != 0 {
            warn!(
                dir = %dir.display(),
                extra = roots_size % ROOT_RECORD_SIZE,
                "discarding torn index root record"
            );
        }

        let nodes_size = nodes.size()?;
        let mut root = None;
        let mut ts = 0u64;
        while n > 0 {
            let mut rec = [0u8; ROOT_RECORD_SIZE as usize];
            let got = roots.read_at(&mut rec, (n - 1) * ROOT_RECORD_SIZE)?;
            if got == rec.len() {
                let rts = u64::from_be_bytes(rec[0..8].try_into().expect("8 bytes"));
                let off = u64::from_be_bytes(rec[8..16].try_into().expect("8 bytes"));
                let size = u64::from_be_bytes(rec[16..24].try_into().expect("8 bytes"));
                if rts <= max_ts && size > 0 && size <= u32::MAX as u64 && off + size <= nodes_size
                {
                    root = Some(NodeRef::Disk { off, size: size as u32 });
                    ts = rts;
                    break;
                }
                warn!(dir = %dir.display(), ts = rts, "skipping unusable index root record");
            }
            n -= 1;
        }
        if !opts.read_only {
            roots.set_offset(n * ROOT_RECORD_SIZE)?;
        }

        debug!(dir = %dir.display(), ts, "opened index tree");

        Ok(Tree {
            inner: Arc::new(TreeInner {
                nodes,
                roots,
                state: RwLock::new(TreeState { root, ts, closed: false }),
                cache: Mutex::new(LruCache::new(cache_cap)),
                opts,
            }),
        })
    }

    /// Last transaction id integrated into the tree.
    pub fn ts(&self) -> u64 {
        self.inner.state.read().ts
    }

    /// Applies one transaction's `(key, value)` pairs and publishes the new
    /// root and `ts` atomically.
    ///
    /// `ts` must exceed the tree's current ts; repeated keys within `pairs`
    /// record one history entry each.
    pub fn insert_batch(&self, pairs: &[(Vec<u8>, Vec<u8>)], ts: u64) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        if inner.opts.read_only {
            return Err(Error::ReadOnly);
        }
        if pairs.is_empty() {
            return Err(Error::IllegalArguments { what: "pairs".to_string() });
        }
        if ts <= state.ts {
            return Err(Error::IllegalArguments { what: "ts".to_string() });
        }

        let mut root = state.root.clone();
        for (key, value) in pairs {
            root = Some(match root {
                None => NodeRef::Mem(Arc::new(Node::Leaf(LeafNode {
                    entries: vec![LeafEntry {
                        key: key.clone(),
                        value: value.clone(),
                        tss: vec![ts],
                    }],
                }))),
                Some(r) => match inner.insert_node(&r, key, value, ts)? {
                    Outcome::One(node) => node,
                    Outcome::Split(left, right) => {
                        let children = vec![
                            ChildRef { max_key: mem_max_key(&left), node: left },
                            ChildRef { max_key: mem_max_key(&right), node: right },
                        ];
                        NodeRef::Mem(Arc::new(Node::Branch(BranchNode { children })))
                    }
                },
            });
        }

        state.root = root;
        state.ts = ts;
        Ok(())
    }

    /// Freezes resident nodes to the nodes log and appends a root record.
    ///
    /// A no-op when the root is already frozen.
    pub fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        let mut state = inner.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        if inner.opts.read_only {
            return Err(Error::ReadOnly);
        }

        let root = match &state.root {
            None => return Ok(()),
            Some(NodeRef::Disk { .. }) => return Ok(()),
            Some(r @ NodeRef::Mem(_)) => r.clone(),
        };

        let (off, size) = inner.flush_node(&root)?;
        inner.nodes.sync()?;

        let mut rec = [0u8; ROOT_RECORD_SIZE as usize];
        rec[0..8].copy_from_slice(&state.ts.to_be_bytes());
        rec[8..16].copy_from_slice(&off.to_be_bytes());
        rec[16..24].copy_from_slice(&(size as u64).to_be_bytes());
        inner.roots.append(&rec)?;
        inner.roots.sync()?;

        state.root = Some(NodeRef::Disk { off, size });
        debug!(ts = state.ts, off, size, "flushed index root");
        Ok(())
    }

    /// Captures an immutable view of the current root and ts.
    pub fn snapshot(&self) -> Result<Snapshot> {
        let state = self.inner.state.read();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        Ok(Snapshot::new(Arc::clone(&self.inner), state.root.clone(), state.ts))
    }

    /// Flushes (when writable) and closes the backing logs.
    pub fn close(&self) -> Result<()> {
        if !self.inner.opts.read_only {
            self.flush()?;
        }
        let mut state = self.inner.state.write();
        if state.closed {
            return Err(Error::AlreadyClosed);
        }
        state.closed = true;
        self.inner.nodes.close()?;
        self.inner.roots.close()?;
        Ok(())
    }
}

impl TreeInner {
    /// Resolves a node reference, reading and caching frozen nodes.
    pub(crate) fn load(&self, node_ref: &NodeRef) -> Result<Arc<Node>> {
        match node_ref {
            NodeRef::Mem(node) => Ok(Arc::clone(node)),
            NodeRef::Disk { off, size } => {
                if let Some(node) = self.cache.lock().get(off) {
                    return Ok(Arc::clone(node));
                }
                let mut buf = vec![0u8; *size as usize];
                let got = self.nodes.read_at(&mut buf, *off)?;
                if got < buf.len() {
                    return Err(Error::Corrupted {
                        reason: format!("node page at {off} truncated"),
                    });
                }
                let node = Arc::new(Node::deserialize(&buf)?);
                self.cache.lock().put(*off, Arc::clone(&node));
                Ok(node)
            }
        }
    }

    /// Copy-on-write insertion. Returned references are always resident.
    fn insert_node(&self, node_ref: &NodeRef, key: &[u8], value: &[u8], ts: u64) -> Result<Outcome> {
        let mut arc = self.load(node_ref)?;
        let node = Arc::make_mut(&mut arc);

        match node {
            Node::Leaf(leaf) => {
                match leaf.search(key) {
                    Ok(i) => {
                        let entry = &mut leaf.entries[i];
                        entry.value = value.to_vec();
                        entry.tss.insert(0, ts);
                    }
                    Err(i) => leaf.entries.insert(
                        i,
                        LeafEntry { key: key.to_vec(), value: value.to_vec(), tss: vec![ts] },
                    ),
                }

                if node.serialized_size() > self.opts.max_node_size {
                    if let Node::Leaf(leaf) = node {
                        if leaf.entries.len() > 1 {
                            let mid = leaf.entries.len() / 2;
                            let right = LeafNode { entries: leaf.entries.split_off(mid) };
                            return Ok(Outcome::Split(
                                NodeRef::Mem(arc),
                                NodeRef::Mem(Arc::new(Node::Leaf(right))),
                            ));
                        }
                    }
                }
            }
            Node::Branch(branch) => {
                let idx = branch.child_for(key);
                let child_ref = branch.children[idx].node.clone();
                match self.insert_node(&child_ref, key, value, ts)? {
                    Outcome::One(child) => {
                        branch.children[idx] =
                            ChildRef { max_key: mem_max_key(&child), node: child };
                    }
                    Outcome::Split(left, right) => {
                        let slots = [
                            ChildRef { max_key: mem_max_key(&left), node: left },
                            ChildRef { max_key: mem_max_key(&right), node: right },
                        ];
                        branch.children.splice(idx..=idx, slots);
                    }
                }

                if node.serialized_size() > self.opts.max_node_size {
                    if let Node::Branch(branch) = node {
                        if branch.children.len() > 1 {
                            let mid = branch.children.len() / 2;
                            let right = BranchNode { children: branch.children.split_off(mid) };
                            return Ok(Outcome::Split(
                                NodeRef::Mem(arc),
                                NodeRef::Mem(Arc::new(Node::Branch(right))),
                            ));
                        }
                    }
                }
            }
        }

        Ok(Outcome::One(NodeRef::Mem(arc)))
    }

    /// Freezes a subtree bottom-up; returns its location in the nodes log.
    fn flush_node(&self, node_ref: &NodeRef) -> Result<(u64, u32)> {
        let arc = match node_ref {
            NodeRef::Disk { off, size } => return Ok((*off, *size)),
            NodeRef::Mem(arc) => arc,
        };

        let (bytes, frozen) = match &**arc {
            Node::Leaf(_) => (arc.serialize(), Arc::clone(arc)),
            Node::Branch(branch) => {
                let mut children = Vec::with_capacity(branch.children.len());
                for child in &branch.children {
                    let (off, size) = self.flush_node(&child.node)?;
                    children.push(ChildRef {
                        max_key: child.max_key.clone(),
                        node: NodeRef::Disk { off, size },
                    });
                }
                let node = Node::Branch(BranchNode { children });
                (node.serialize(), Arc::new(node))
            }
        };

        let (off, _) = self.nodes.append(&bytes)?;
        self.cache.lock().put(off, frozen);
        Ok((off, bytes.len() as u32))
    }

    /// Latest value and ts for `key`, descending from `root`.
    pub(crate) fn lookup(&self, root: &Option<NodeRef>, key: &[u8]) -> Result<(Vec<u8>, u64)> {
        self.with_entry(root, key, |e| (e.value.clone(), e.tss[0]))
    }

    /// Up to `limit` transaction ids that wrote `key`, newest first.
    pub(crate) fn lookup_history(
        &self,
        root: &Option<NodeRef>,
        key: &[u8],
        limit: usize,
    ) -> Result<Vec<u64>> {
        if limit == 0 {
            return Err(Error::IllegalArguments { what: "limit".to_string() });
        }
        self.with_entry(root, key, |e| e.tss.iter().take(limit).copied().collect())
    }

    /// Descends from `root` to the leaf entry for `key`.
    fn with_entry<T>(
        &self,
        root: &Option<NodeRef>,
        key: &[u8],
        f: impl FnOnce(&LeafEntry) -> T,
    ) -> Result<T> {
        let mut cur = match root {
            None => return Err(Error::KeyNotFound),
            Some(r) => r.clone(),
        };
        loop {
            let node = self.load(&cur)?;
            match &*node {
                Node::Branch(b) => {
                    let idx = b.children.partition_point(|c| c.max_key.as_slice() < key);
                    if idx == b.children.len() {
                        return Err(Error::KeyNotFound);
                    }
                    cur = b.children[idx].node.clone();
                }
                Node::Leaf(l) => {
                    return match l.search(key) {
                        Ok(i) => Ok(f(&l.entries[i])),
                        Err(_) => Err(Error::KeyNotFound),
                    };
                }
            }
        }
    }
}

fn mem_max_key(node_ref: &NodeRef) -> Vec<u8> {
    match node_ref {
        NodeRef::Mem(node) => node.max_key().to_vec(),
        NodeRef::Disk { .. } => unreachable!("freshly inserted nodes are resident"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    fn key(i: u64) -> Vec<u8> {
        i.to_be_bytes().to_vec()
    }

    fn small_tree_opts() -> TreeOptions {
        // Tiny nodes force deep trees quickly.
        TreeOptions { max_node_size: 128, ..Default::default() }
    }

    #[test]
    fn test_insert_and_get() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();

        tree.insert_batch(&[(key(1), vec![10]), (key(2), vec![20])], 1).unwrap();

        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.ts(), 1);
        assert_eq!(snap.get(&key(1)).unwrap(), (vec![10], 1));
        assert_eq!(snap.get(&key(2)).unwrap(), (vec![20], 1));
        assert!(matches!(snap.get(&key(3)), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_ts_must_advance() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();

        tree.insert_batch(&[(key(1), vec![1])], 5).unwrap();
        assert!(matches!(
            tree.insert_batch(&[(key(2), vec![2])], 5),
            Err(Error::IllegalArguments { .. })
        ));
        assert_eq!(tree.ts(), 5);
    }

    #[test]
    fn test_history_newest_first() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();

        for ts in 1..=10u64 {
            tree.insert_batch(&[(key(7), vec![ts as u8])], ts).unwrap();
        }

        let snap = tree.snapshot().unwrap();
        assert_eq!(snap.get(&key(7)).unwrap(), (vec![10], 10));
        assert_eq!(snap.get_ts(&key(7), 10).unwrap(), (1..=10).rev().collect::<Vec<_>>());
        assert_eq!(snap.get_ts(&key(7), 3).unwrap(), vec![10, 9, 8]);
    }

    #[test]
    fn test_many_keys_with_splits() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), small_tree_opts(), u64::MAX).unwrap();

        // Interleaved key order to exercise splits in both directions.
        let pairs: Vec<(Vec<u8>, Vec<u8>)> =
            (0..500u64).map(|i| (key((i * 7919) % 1000), key(i))).collect();
        for (ts, chunk) in pairs.chunks(25).enumerate() {
            tree.insert_batch(chunk, ts as u64 + 1).unwrap();
        }

        let snap = tree.snapshot().unwrap();
        for (k, _) in &pairs {
            assert!(snap.get(k).is_ok(), "missing key {k:?}");
        }
    }

    #[test]
    fn test_flush_and_reopen() {
        let dir = tempdir().unwrap();
        {
            let tree = Tree::open(dir.path(), small_tree_opts(), u64::MAX).unwrap();
            for ts in 1..=20u64 {
                let pairs: Vec<_> = (0..20u64).map(|j| (key(j), key(ts))).collect();
                tree.insert_batch(&pairs, ts).unwrap();
            }
            tree.close().unwrap();
        }

        let tree = Tree::open(dir.path(), small_tree_opts(), u64::MAX).unwrap();
        assert_eq!(tree.ts(), 20);

        let snap = tree.snapshot().unwrap();
        for j in 0..20u64 {
            let (value, ts) = snap.get(&key(j)).unwrap();
            assert_eq!(value, key(20));
            assert_eq!(ts, 20);
            assert_eq!(snap.get_ts(&key(j), 100).unwrap().len(), 20);
        }
    }

    #[test]
    fn test_reopen_skips_roots_beyond_max_ts() {
        let dir = tempdir().unwrap();
        {
            let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();
            tree.insert_batch(&[(key(1), vec![1])], 1).unwrap();
            tree.flush().unwrap();
            tree.insert_batch(&[(key(2), vec![2])], 2).unwrap();
            tree.flush().unwrap();
            tree.close().unwrap();
        }

        // A commit-log tail loss would cap the usable ts at 1.
        let tree = Tree::open(dir.path(), TreeOptions::default(), 1).unwrap();
        assert_eq!(tree.ts(), 1);

        let snap = tree.snapshot().unwrap();
        assert!(snap.get(&key(1)).is_ok());
        assert!(matches!(snap.get(&key(2)), Err(Error::KeyNotFound)));
    }

    #[test]
    fn test_snapshot_isolation() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();

        tree.insert_batch(&[(key(1), vec![1])], 1).unwrap();
        let snap1 = tree.snapshot().unwrap();

        tree.insert_batch(&[(key(1), vec![2]), (key(2), vec![2])], 2).unwrap();
        let snap2 = tree.snapshot().unwrap();

        // snap1 still sees the ts-1 state, including through a flush.
        tree.flush().unwrap();
        assert_eq!(snap1.ts(), 1);
        assert_eq!(snap1.get(&key(1)).unwrap(), (vec![1], 1));
        assert!(matches!(snap1.get(&key(2)), Err(Error::KeyNotFound)));

        assert_eq!(snap2.ts(), 2);
        assert_eq!(snap2.get(&key(1)).unwrap(), (vec![2], 2));

        // Snapshot monotonicity.
        assert!(snap2.ts() >= snap1.ts());
    }

    #[test]
    fn test_read_only_rejects_mutators() {
        let dir = tempdir().unwrap();
        {
            let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();
            tree.insert_batch(&[(key(1), vec![1])], 1).unwrap();
            tree.close().unwrap();
        }

        let tree = Tree::open(
            dir.path(),
            TreeOptions { read_only: true, ..Default::default() },
            u64::MAX,
        )
        .unwrap();
        assert!(matches!(
            tree.insert_batch(&[(key(2), vec![2])], 2),
            Err(Error::ReadOnly)
        ));
        assert!(matches!(tree.flush(), Err(Error::ReadOnly)));

        let snap = tree.snapshot().unwrap();
        assert!(snap.get(&key(1)).is_ok());
    }

    #[test]
    fn test_closed_rejects_operations() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), TreeOptions::default(), u64::MAX).unwrap();
        tree.insert_batch(&[(key(1), vec![1])], 1).unwrap();
        tree.close().unwrap();

        assert!(matches!(tree.snapshot(), Err(Error::AlreadyClosed)));
        assert!(matches!(
            tree.insert_batch(&[(key(2), vec![2])], 2),
            Err(Error::AlreadyClosed)
        ));
        assert!(matches!(tree.close(), Err(Error::AlreadyClosed)));
    }

    #[test]
    fn test_snapshot_survives_concurrent_inserts() {
        let dir = tempdir().unwrap();
        let tree = Tree::open(dir.path(), small_tree_opts(), u64::MAX).unwrap();
        tree.insert_batch(&[(key(0), vec![0])], 1).unwrap();

        let snap = tree.snapshot().unwrap();
        let writer = {
            let tree = tree.clone();
            std::thread::spawn(move || {
                for ts in 2..=50u64 {
                    let pairs: Vec<_> = (0..10u64).map(|j| (key(j), key(ts))).collect();
                    tree.insert_batch(&pairs, ts).unwrap();
                }
            })
        };

        for _ in 0..100 {
            assert_eq!(snap.ts(), 1);
            assert_eq!(snap.get(&key(0)).unwrap(), (vec![0], 1));
        }
        writer.join().unwrap();

        let fresh = tree.snapshot().unwrap();
        assert_eq!(fresh.ts(), 50);
    }
}
