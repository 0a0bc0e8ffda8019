//! The transaction store: three append-only logs, a commit pipeline, crash
//! recovery and verifiable reads.
//!
//! ## Logs
//!
//! - value logs (`val_0` …): raw value bytes, no framing
//! - tx log (`tx`): framed transaction records, located via the commit log
//! - commit log (`commit`): one 16-byte record `tx_off ‖ tx_size` per
//!   transaction; its length divided by 16 is the committed count and the
//!   single source of truth
//!
//! ## Commit pipeline
//!
//! Value bytes are handed to a per-value-log worker thread while the caller
//! hashes entries and builds the transaction's Merkle tree. After joining on
//! the worker's offsets, the commit mutex serializes the tail: assign the id,
//! read the binary-linking tree summary, append the tx record, derive the
//! accumulated hash, append the commit record (the linearization point) and
//! only then grow the linking tree. The tree never covers an uncommitted
//! transaction and always lags the new transaction by exactly one.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering},
        mpsc, Arc,
    },
    thread::JoinHandle,
};

use parking_lot::Mutex;
use quiverdb_appendable::{Appendable, MultiAppendable};
use quiverdb_index::{Snapshot, Tree};
use quiverdb_types::{sha256, Hash, InclusionProof, LinkingTree, MerkleTree, ZERO_HASH};
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    indexer::{self, IndexerShared},
    lock::DirLock,
    options::Options,
    proof::{DualProof, LinearProof, TxHeader},
    reader::TxReader,
    tx::{self, Caps, Tx, TxEntry, KV, TX_HEADER_SIZE},
};

/// Commit-log record: `u64 tx_off ‖ u64 tx_size`.
pub(crate) const CLOG_RECORD_SIZE: u64 = 16;

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxSummary {
    /// Assigned transaction id.
    pub id: u64,
    /// Commit wall-clock seconds.
    pub ts: i64,
    /// Accumulated hash after this transaction.
    pub alh: Hash,
    /// Number of entries committed.
    pub nentries: u32,
}

/// Job handed to a value-log worker: append each value, reply with the
/// offsets claimed.
struct VLogJob {
    values: Vec<Vec<u8>>,
    reply: mpsc::Sender<Result<Vec<u64>>>,
}

struct CommitState {
    /// Binary-linking tree; its leaves are the accumulated hashes of every
    /// committed transaction, in order.
    tree: LinkingTree,
}

pub(crate) struct StoreInner {
    opts: Options,
    pub(crate) caps: Caps,
    _dir_lock: Option<DirLock>,
    v_logs: Vec<Arc<dyn Appendable>>,
    pub(crate) tx_log: Arc<dyn Appendable>,
    c_log: Arc<dyn Appendable>,
    cstate: Mutex<CommitState>,
    committed: AtomicU64,
    commits_in_flight: AtomicU32,
    next_vlog: AtomicUsize,
    pub(crate) closed: AtomicBool,
    vlog_txs: Mutex<Vec<mpsc::Sender<VLogJob>>>,
    vlog_handles: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) index: Option<Tree>,
    pub(crate) indexer: IndexerShared,
}

/// An immutable, verifiable key-value store.
///
/// Shared across threads behind an `Arc`; every method takes `&self`.
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    /// Opens or creates a store under directory `path`.
    ///
    /// Acquires an exclusive directory lock for the store's lifetime and
    /// recovers any torn tails left by a crash.
    pub fn open(path: impl AsRef<Path>, opts: Options) -> Result<Store> {
        opts.validate()?;
        let path = path.as_ref().to_path_buf();

        if path.exists() && !path.is_dir() {
            return Err(Error::PathIsNotADirectory { path });
        }
        fs::create_dir_all(&path)?;
        let dir_lock = DirLock::acquire(&path)?;

        // Existing stores dictate their own limits: creation-time metadata
        // bounds record decoding and the chunk-file size, whatever the
        // caller passed this time.
        let mut opts = opts;
        if let Ok(probe) =
            MultiAppendable::open(path.join("tx"), opts.log_opts("tx").with_read_only(true))
        {
            opts.adopt_metadata(&probe.metadata());
            probe.close()?;
        }

        // One value log per IO lane, or however many a previous run left.
        let mut n_vlogs = 0;
        while path.join(format!("val_{n_vlogs}")).is_dir() {
            n_vlogs += 1;
        }
        if n_vlogs == 0 {
            n_vlogs = opts.max_io_concurrency as usize;
        }

        let mut v_logs: Vec<Arc<dyn Appendable>> = Vec::with_capacity(n_vlogs);
        for i in 0..n_vlogs {
            v_logs.push(Arc::new(MultiAppendable::open(
                path.join(format!("val_{i}")),
                opts.log_opts("val"),
            )?));
        }
        let tx_log: Arc<dyn Appendable> =
            Arc::new(MultiAppendable::open(path.join("tx"), opts.log_opts("tx"))?);
        let c_log: Arc<dyn Appendable> =
            Arc::new(MultiAppendable::open(path.join("commit"), opts.log_opts("txi"))?);

        if opts.index_dir.is_none() {
            opts.index_dir = Some(path.join("index"));
        }

        info!(path = %path.display(), "opening store");
        Self::start(v_logs, tx_log, c_log, opts, Some(dir_lock))
    }

    /// Opens a store over caller-provided logs.
    ///
    /// The injection seam for tests and custom storage: the logs may wrap
    /// real appendables with fault injection or instrumentation. No
    /// directory lock is taken; indexing runs only when
    /// [`Options::index_dir`] is set.
    pub fn open_with(
        v_logs: Vec<Arc<dyn Appendable>>,
        tx_log: Arc<dyn Appendable>,
        c_log: Arc<dyn Appendable>,
        opts: Options,
    ) -> Result<Store> {
        opts.validate()?;
        if v_logs.is_empty() {
            return Err(Error::IllegalArguments { what: "v_logs".to_string() });
        }
        let mut opts = opts;
        opts.adopt_metadata(&tx_log.metadata());
        Self::start(v_logs, tx_log, c_log, opts, None)
    }

    fn start(
        v_logs: Vec<Arc<dyn Appendable>>,
        tx_log: Arc<dyn Appendable>,
        c_log: Arc<dyn Appendable>,
        opts: Options,
        dir_lock: Option<DirLock>,
    ) -> Result<Store> {
        let caps = Caps {
            max_tx_entries: opts.max_tx_entries,
            max_key_len: opts.max_key_len,
            max_value_len: opts.max_value_len,
        };

        let (tree, committed) = Self::recover(&v_logs, &tx_log, &c_log, &opts, &caps)?;

        let index = match &opts.index_dir {
            Some(dir) => Some(Tree::open(dir, opts.tree_opts(), committed)?),
            None => None,
        };

        let inner = Arc::new(StoreInner {
            caps,
            _dir_lock: dir_lock,
            v_logs,
            tx_log,
            c_log,
            cstate: Mutex::new(CommitState { tree }),
            committed: AtomicU64::new(committed),
            commits_in_flight: AtomicU32::new(0),
            next_vlog: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            vlog_txs: Mutex::new(Vec::new()),
            vlog_handles: Mutex::new(Vec::new()),
            index,
            indexer: IndexerShared::default(),
            opts,
        });

        if !inner.opts.read_only {
            inner.spawn_vlog_workers();
            if inner.index.is_some() {
                let handle = indexer::spawn(Arc::clone(&inner));
                *inner.indexer.handle.lock() = Some(handle);
            }
        }

        Ok(Store { inner })
    }

    /// Rebuilds in-memory state from the logs, truncating torn tails.
    ///
    /// The commit log is authoritative: its record count is the committed
    /// transaction count. Trailing records pointing past the end of the tx
    /// log (a commit-log append that outlived a lost tx-log write) are
    /// dropped; the tx log is cut to the last surviving record; every value
    /// log is cut to the highest offset any committed transaction references
    /// in it. Replay recomputes each transaction's Merkle root and
    /// accumulated hash to seed the linking tree.
    fn recover(
        v_logs: &[Arc<dyn Appendable>],
        tx_log: &Arc<dyn Appendable>,
        c_log: &Arc<dyn Appendable>,
        opts: &Options,
        caps: &Caps,
    ) -> Result<(LinkingTree, u64)> {
        let clog_size = c_log.size()?;
        let mut n = clog_size / CLOG_RECORD_SIZE;
        if clog_size % CLOG_RECORD_SIZE != 0 {
            warn!(extra = clog_size % CLOG_RECORD_SIZE, "discarding torn commit-log record");
            if !opts.read_only {
                c_log.set_offset(n * CLOG_RECORD_SIZE)?;
            }
        }

        let tx_log_size = tx_log.size()?;
        let mut last_end = 0u64;
        while n > 0 {
            let (off, size) = read_commit_record(c_log.as_ref(), n)?;
            if size >= TX_HEADER_SIZE as u64
                && size <= caps.max_record_size()
                && off + size <= tx_log_size
            {
                last_end = off + size;
                break;
            }
            warn!(tx_id = n, off, size, "dropping commit record past tx-log end");
            n -= 1;
            if !opts.read_only {
                c_log.set_offset(n * CLOG_RECORD_SIZE)?;
            }
        }
        if !opts.read_only {
            tx_log.set_offset(last_end)?;
        }

        // Replay committed transactions: rebuild the linking tree and find
        // the committed watermark of each value log.
        let mut tree = LinkingTree::new();
        let mut vlog_tips = vec![0u64; v_logs.len()];
        let mut tx = Tx::with_capacity(caps.max_tx_entries as usize);
        let mut buf: Vec<u8> = Vec::new();
        let mut prev_alh = ZERO_HASH;

        for id in 1..=n {
            let (off, size) = read_commit_record(c_log.as_ref(), id)?;
            if size < TX_HEADER_SIZE as u64 || size > caps.max_record_size() {
                return Err(Error::CorruptedCommitLog {
                    reason: format!("record {id} has invalid size {size}"),
                });
            }
            buf.resize(size as usize, 0);
            let got = tx_log.read_at(&mut buf, off)?;
            if got < buf.len() {
                return Err(Error::CorruptedTxData { tx_id: id });
            }
            tx.decode(&buf, caps)?;
            if tx.id != id {
                return Err(Error::CorruptedTxData { tx_id: id });
            }

            tx.prev_alh = prev_alh;
            let alh = tx.alh();
            tree.append(alh);
            prev_alh = alh;

            for e in tx.entries() {
                let (log_id, v_off) = tx::split_v_off(e.v_off);
                if log_id >= v_logs.len() {
                    return Err(Error::CorruptedTxData { tx_id: id });
                }
                vlog_tips[log_id] = vlog_tips[log_id].max(v_off + e.value_len as u64);
            }
        }

        for (i, v_log) in v_logs.iter().enumerate() {
            let size = v_log.size()?;
            if vlog_tips[i] > size {
                return Err(Error::CorruptedCommitLog {
                    reason: format!(
                        "value log {i} is {size} bytes but committed data reaches {}",
                        vlog_tips[i]
                    ),
                });
            }
            if vlog_tips[i] < size && !opts.read_only {
                warn!(
                    vlog = i,
                    discarded = size - vlog_tips[i],
                    "truncating uncommitted value-log tail"
                );
                v_log.set_offset(vlog_tips[i])?;
            }
        }

        if n > 0 {
            debug!(tx_count = n, "recovered store state");
        }
        Ok((tree, n))
    }

    /// Commits a batch of entries as one transaction.
    pub fn commit(&self, entries: &[KV]) -> Result<TxSummary> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if inner.opts.read_only {
            return Err(Error::ReadOnly);
        }
        inner.validate_entries(entries)?;
        let _gate = ConcurrencyGate::acquire(
            &inner.commits_in_flight,
            inner.opts.max_concurrency,
        )?;

        // Sort by key; adjacent equality is a duplicate.
        let mut order: Vec<usize> = (0..entries.len()).collect();
        order.sort_by(|&a, &b| entries[a].key.cmp(&entries[b].key));
        for pair in order.windows(2) {
            if entries[pair[0]].key == entries[pair[1]].key {
                return Err(Error::DuplicatedKey);
            }
        }

        // Hand the value bytes to this transaction's value-log worker; hash
        // entries and build the Merkle tree while it writes.
        let log_id = inner.next_vlog.fetch_add(1, Ordering::Relaxed) % inner.v_logs.len();
        let (reply_tx, reply_rx) = mpsc::channel();
        let values: Vec<Vec<u8>> = order.iter().map(|&i| entries[i].value.clone()).collect();
        let sender = inner
            .vlog_txs
            .lock()
            .get(log_id)
            .cloned()
            .ok_or(Error::AlreadyClosed)?;
        sender
            .send(VLogJob { values, reply: reply_tx })
            .map_err(|_| Error::AlreadyClosed)?;

        let mut tx_entries: Vec<TxEntry> = order
            .iter()
            .map(|&i| {
                TxEntry::new(
                    entries[i].key.clone(),
                    entries[i].value.len() as u32,
                    sha256(&entries[i].value),
                )
            })
            .collect();
        let leaves: Vec<Hash> = tx_entries.iter().map(TxEntry::digest).collect();
        let eh = MerkleTree::from_leaves(&leaves).root();

        let offsets = reply_rx.recv().map_err(|_| Error::AlreadyClosed)??;
        for (entry, off) in tx_entries.iter_mut().zip(offsets) {
            entry.v_off = tx::join_v_off(log_id, off);
        }
        let entry_bytes = tx::encode_entries(&tx_entries);
        let nentries = tx_entries.len() as u32;

        // Linearization under the commit mutex.
        let mut st = inner.cstate.lock();
        let id = st.tree.len() + 1;
        let ts = chrono::Utc::now().timestamp();
        let bl_tx_id = st.tree.len();
        let bl_root = st.tree.root();

        let mut record = Vec::with_capacity(TX_HEADER_SIZE + entry_bytes.len());
        tx::encode_header(&mut record, id, ts, bl_tx_id, bl_root, nentries);
        record.extend_from_slice(&entry_bytes);
        let (tx_off, _) = inner.tx_log.append(&record)?;

        let prev_alh = match id {
            1 => ZERO_HASH,
            _ => st.tree.leaf(id - 2).ok_or(Error::TxNotFound { tx_id: id - 1 })?,
        };
        let header = TxHeader { id, ts, bl_tx_id, bl_root, nentries, eh, prev_alh };
        let alh = header.alh();

        let mut commit_record = [0u8; CLOG_RECORD_SIZE as usize];
        commit_record[0..8].copy_from_slice(&tx_off.to_be_bytes());
        commit_record[8..16].copy_from_slice(&(record.len() as u64).to_be_bytes());
        inner.c_log.append(&commit_record)?;

        // Committed: the linking tree and the published count must track the
        // commit log exactly, even if the fsync below fails.
        st.tree.append(alh);
        inner.committed.store(id, Ordering::Release);

        if inner.opts.synced {
            inner.v_logs[log_id].sync()?;
            inner.tx_log.sync()?;
            inner.c_log.sync()?;
        }
        drop(st);

        // Taking the control mutex orders this notify after any in-progress
        // caught-up check, so the indexer cannot park past this commit.
        drop(inner.indexer.ctl.lock());
        inner.indexer.cv.notify_all();

        Ok(TxSummary { id, ts, alh, nentries })
    }

    /// Number of committed transactions.
    pub fn tx_count(&self) -> Result<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        Ok(self.inner.committed.load(Ordering::Acquire))
    }

    /// Allocates a reusable transaction decode buffer sized to this store's
    /// limits.
    pub fn new_tx(&self) -> Tx {
        Tx::with_capacity(self.inner.caps.max_tx_entries as usize)
    }

    /// Reads committed transaction `id` into `tx`.
    pub fn read_tx(&self, id: u64, tx: &mut Tx) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        self.inner.read_tx_into(id, tx)
    }

    /// Streams committed transactions starting at `from_id` through a
    /// read-ahead buffer of `buf_size` bytes.
    pub fn tx_reader(&self, from_id: u64, buf_size: usize) -> Result<TxReader<'_>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if from_id == 0 {
            return Err(Error::IllegalArguments { what: "from_id".to_string() });
        }
        if buf_size == 0 {
            return Err(Error::IllegalArguments { what: "buf_size".to_string() });
        }
        Ok(TxReader::new(&self.inner, from_id, buf_size))
    }

    /// Reads the value for `key` out of transaction `tx`.
    pub fn read_value(&self, tx: &Tx, key: &[u8]) -> Result<Vec<u8>> {
        let idx = tx.index_of(key).ok_or(Error::KeyNotFound)?;
        let entry = &tx.entries()[idx];
        let mut value = vec![0u8; entry.value_len as usize];
        self.read_value_at(&mut value, entry.v_off, entry.h_value)?;
        Ok(value)
    }

    /// Reads `dst.len()` value bytes at the tagged offset `v_off` and
    /// verifies them against `h_value`.
    pub fn read_value_at(&self, dst: &mut [u8], v_off: u64, h_value: Hash) -> Result<usize> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        let (log_id, off) = tx::split_v_off(v_off);
        let v_log = inner.v_logs.get(log_id).ok_or(Error::CorruptedValueData)?;
        if !dst.is_empty() {
            let got = v_log.read_at(dst, off)?;
            if got < dst.len() {
                return Err(Error::CorruptedValueData);
            }
        }
        if sha256(dst) != h_value {
            return Err(Error::CorruptedValueData);
        }
        Ok(dst.len())
    }

    /// Accumulated hash after transaction `tx_id` (`tx_id = 0` yields the
    /// all-zero hash).
    pub fn alh(&self, tx_id: u64) -> Result<Hash> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        self.inner.alh(tx_id)
    }

    /// Inclusion proof for entry `entry_index` of transaction `tx_id`.
    pub fn inclusion_proof(&self, tx_id: u64, entry_index: usize) -> Result<InclusionProof> {
        let mut tx = self.new_tx();
        self.read_tx(tx_id, &mut tx)?;
        tx.proof(entry_index)
            .ok_or_else(|| Error::IllegalArguments { what: "entry_index".to_string() })
    }

    /// Linear proof from `from` to `to` (inclusive, `from <= to`).
    pub fn linear_proof(&self, from: u64, to: u64) -> Result<LinearProof> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if from == 0 || from > to {
            return Err(Error::IllegalArguments { what: "from".to_string() });
        }
        let committed = inner.committed.load(Ordering::Acquire);
        if to > committed {
            return Err(Error::TxNotFound { tx_id: to });
        }
        let span = to - from + 1;
        if span > inner.opts.max_linear_proof_len {
            return Err(Error::MaxLinearProofLenExceeded {
                span,
                max: inner.opts.max_linear_proof_len,
            });
        }

        let mut terms = Vec::with_capacity(span as usize);
        terms.push(inner.alh(from)?);
        let mut tx = self.new_tx();
        for id in (from + 1)..=to {
            inner.read_tx_into(id, &mut tx)?;
            terms.push(tx.inner_hash());
        }
        Ok(LinearProof { from, to, terms })
    }

    /// Dual proof between `a` and `b`, in either order.
    pub fn dual_proof(&self, a: u64, b: u64) -> Result<DualProof> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if a == 0 || b == 0 {
            return Err(Error::IllegalArguments { what: "tx id".to_string() });
        }
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let committed = inner.committed.load(Ordering::Acquire);
        if hi > committed {
            return Err(Error::TxNotFound { tx_id: hi });
        }

        let mut tx = self.new_tx();
        inner.read_tx_into(lo, &mut tx)?;
        let source = tx.header();
        inner.read_tx_into(hi, &mut tx)?;
        let target = tx.header();

        let st = inner.cstate.lock();
        let (inclusion, last_inclusion, consistency) = if lo < hi {
            (
                st.tree
                    .inclusion_proof(lo - 1, hi - 1)
                    .ok_or(Error::TxNotFound { tx_id: hi })?,
                st.tree
                    .inclusion_proof(hi - 2, hi - 1)
                    .ok_or(Error::TxNotFound { tx_id: hi })?,
                if lo > 1 {
                    st.tree
                        .consistency_proof(lo - 1, hi - 1)
                        .ok_or(Error::TxNotFound { tx_id: hi })?
                } else {
                    Vec::new()
                },
            )
        } else {
            (Vec::new(), Vec::new(), Vec::new())
        };

        Ok(DualProof { source, target, inclusion, consistency, last_inclusion })
    }

    /// A read-only snapshot of the secondary index.
    ///
    /// The snapshot's `ts` is the last *integrated* transaction; a just-
    /// committed transaction appears once the indexer catches up.
    pub fn snapshot(&self) -> Result<Snapshot> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        let tree = self.inner.index.as_ref().ok_or(Error::IndexingDisabled)?;
        Ok(tree.snapshot()?)
    }

    /// Last transaction id integrated into the index, or the indexer's
    /// sticky error.
    pub fn index_info(&self) -> Result<u64> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if let Some(reason) = self.inner.indexer.error.lock().clone() {
            return Err(Error::IndexerFailed { reason });
        }
        let tree = self.inner.index.as_ref().ok_or(Error::IndexingDisabled)?;
        Ok(tree.ts())
    }

    /// Flushes and fsyncs all three logs. Idempotent.
    pub fn sync(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if inner.opts.read_only {
            return Err(Error::ReadOnly);
        }
        for v_log in &inner.v_logs {
            v_log.sync()?;
        }
        inner.tx_log.sync()?;
        inner.c_log.sync()?;
        Ok(())
    }

    /// Drains in-flight commits, stops the indexer and the value-log
    /// workers, flushes everything and closes the logs.
    pub fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyClosed);
        }

        // Drain in-flight commits; new ones are already rejected.
        while inner.commits_in_flight.load(Ordering::Acquire) > 0 {
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let mut first_err: Option<Error> = None;
        let mut note = |r: Result<()>| {
            if let Err(e) = r {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        };

        // Indexer: drain, flush, exit.
        {
            let mut ctl = inner.indexer.ctl.lock();
            ctl.stop = true;
        }
        inner.indexer.cv.notify_all();
        if let Some(handle) = inner.indexer.handle.lock().take() {
            if handle.join().is_err() {
                note(Err(Error::IndexerFailed { reason: "indexer panicked".to_string() }));
            }
        }

        // Value-log workers exit when their channels disconnect.
        inner.vlog_txs.lock().clear();
        for handle in inner.vlog_handles.lock().drain(..) {
            let _ = handle.join();
        }

        if let Some(tree) = &inner.index {
            note(tree.close().map_err(Error::from));
        }

        if !inner.opts.read_only {
            for v_log in &inner.v_logs {
                note(v_log.close().map_err(Error::from));
            }
            note(inner.tx_log.close().map_err(Error::from));
            note(inner.c_log.close().map_err(Error::from));
        }

        debug!("store closed");
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.inner.closed.load(Ordering::Acquire) {
            let _ = self.close();
        }
    }
}

impl StoreInner {
    pub(crate) fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn flush_threshold(&self) -> u64 {
        self.opts.index.flush_threshold
    }

    pub(crate) fn flush_interval(&self) -> std::time::Duration {
        self.opts.index.flush_interval
    }

    fn validate_entries(&self, entries: &[KV]) -> Result<()> {
        if entries.is_empty() {
            return Err(Error::NoEntriesProvided);
        }
        if entries.len() > self.caps.max_tx_entries as usize {
            return Err(Error::MaxTxEntriesExceeded {
                nentries: entries.len(),
                max: self.caps.max_tx_entries,
            });
        }
        for kv in entries {
            if kv.key.is_empty() {
                return Err(Error::IllegalArguments { what: "key".to_string() });
            }
            if kv.key.len() > self.caps.max_key_len as usize {
                return Err(Error::MaxKeyLenExceeded {
                    len: kv.key.len(),
                    max: self.caps.max_key_len,
                });
            }
            if kv.value.len() > self.caps.max_value_len as usize {
                return Err(Error::MaxValueLenExceeded {
                    len: kv.value.len(),
                    max: self.caps.max_value_len,
                });
            }
        }
        Ok(())
    }

    /// Accumulated hash after `tx_id`; the linking tree's leaves are exactly
    /// the committed hashes.
    pub(crate) fn alh(&self, tx_id: u64) -> Result<Hash> {
        if tx_id == 0 {
            return Ok(ZERO_HASH);
        }
        self.cstate
            .lock()
            .tree
            .leaf(tx_id - 1)
            .ok_or(Error::TxNotFound { tx_id })
    }

    pub(crate) fn read_commit_record_for(&self, id: u64) -> Result<(u64, u64)> {
        let committed = self.committed();
        if id == 0 || id > committed {
            return Err(Error::TxNotFound { tx_id: id });
        }
        let (off, size) = read_commit_record(self.c_log.as_ref(), id)?;
        if size < TX_HEADER_SIZE as u64 || size > self.caps.max_record_size() {
            return Err(Error::CorruptedCommitLog {
                reason: format!("record {id} has invalid size {size}"),
            });
        }
        Ok((off, size))
    }

    pub(crate) fn read_tx_into(&self, id: u64, tx: &mut Tx) -> Result<()> {
        let (off, size) = self.read_commit_record_for(id)?;
        let mut buf = vec![0u8; size as usize];
        let got = self.tx_log.read_at(&mut buf, off)?;
        if got < buf.len() {
            return Err(Error::CorruptedTxData { tx_id: id });
        }
        tx.decode(&buf, &self.caps)?;
        if tx.id != id {
            return Err(Error::CorruptedTxData { tx_id: id });
        }
        tx.prev_alh = self.alh(id - 1)?;
        Ok(())
    }

    fn spawn_vlog_workers(self: &Arc<Self>) {
        let mut senders = self.vlog_txs.lock();
        let mut handles = self.vlog_handles.lock();
        for v_log in &self.v_logs {
            let (job_tx, job_rx) = mpsc::channel::<VLogJob>();
            let v_log = Arc::clone(v_log);
            let handle = std::thread::Builder::new()
                .name("quiverdb-vlog".to_string())
                .spawn(move || {
                    while let Ok(job) = job_rx.recv() {
                        let mut offsets = Vec::with_capacity(job.values.len());
                        let mut result = Ok(());
                        for value in &job.values {
                            match v_log.append(value) {
                                Ok((off, _)) => offsets.push(off),
                                Err(e) => {
                                    result = Err(Error::from(e));
                                    break;
                                }
                            }
                        }
                        let _ = job.reply.send(result.map(|()| offsets));
                    }
                })
                .expect("spawn value-log worker");
            senders.push(job_tx);
            handles.push(handle);
        }
    }
}

/// Raw commit-log record for transaction `id` (1-based).
fn read_commit_record(c_log: &dyn Appendable, id: u64) -> Result<(u64, u64)> {
    let mut rec = [0u8; CLOG_RECORD_SIZE as usize];
    let got = c_log.read_at(&mut rec, (id - 1) * CLOG_RECORD_SIZE)?;
    if got < rec.len() {
        return Err(Error::CorruptedCommitLog {
            reason: format!("record {id} truncated"),
        });
    }
    let off = u64::from_be_bytes(rec[0..8].try_into().expect("8 bytes"));
    let size = u64::from_be_bytes(rec[8..16].try_into().expect("8 bytes"));
    Ok((off, size))
}

/// RAII guard for the in-flight commit ceiling.
struct ConcurrencyGate<'a> {
    counter: &'a AtomicU32,
}

impl<'a> ConcurrencyGate<'a> {
    fn acquire(counter: &'a AtomicU32, max: u32) -> Result<Self> {
        if counter.fetch_add(1, Ordering::AcqRel) + 1 > max {
            counter.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::MaxConcurrencyExceeded);
        }
        Ok(Self { counter })
    }
}

impl Drop for ConcurrencyGate<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Store directory helper used by tests and tools: the path of value log `i`.
pub fn v_log_dir(store_dir: &Path, i: usize) -> PathBuf {
    store_dir.join(format!("val_{i}"))
}
