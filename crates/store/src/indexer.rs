//! Background index maintenance.
//!
//! One worker thread per store pulls newly committed transactions and
//! applies their `(key, value locator)` pairs to the copy-on-write tree.
//! Checkpoints happen every `flush_threshold` transactions, after
//! `flush_interval` of idle time with pending state, and once more on exit.
//! An error parks the worker; it is surfaced by `index_info` and cleared
//! only by reopening the store.

use std::{
    sync::Arc,
    thread::JoinHandle,
    time::Instant,
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::{
    error::Result,
    store::StoreInner,
    tx::Tx,
};

/// Indexer control block shared with the store.
#[derive(Default)]
pub(crate) struct IndexerShared {
    /// Stop flag, guarded with the condvar below.
    pub ctl: Mutex<IndexerCtl>,
    /// Signaled on every commit and on close.
    pub cv: Condvar,
    /// Sticky failure surfaced by `index_info`.
    pub error: Mutex<Option<String>>,
    /// Worker handle, joined on close.
    pub handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
pub(crate) struct IndexerCtl {
    pub stop: bool,
}

pub(crate) fn spawn(inner: Arc<StoreInner>) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("quiverdb-indexer".to_string())
        .spawn(move || run(inner))
        .expect("spawn indexer thread")
}

fn run(inner: Arc<StoreInner>) {
    let tree = inner.index.clone().expect("indexer requires an index tree");
    let flush_interval = inner.flush_interval();
    let mut since_flush = 0u64;
    let mut last_flush = Instant::now();
    let mut failed = false;

    loop {
        {
            let mut ctl = inner.indexer.ctl.lock();
            if !ctl.stop && (failed || tree.ts() >= inner.committed()) {
                // Bounded wait: a timeout triggers the time-based checkpoint
                // below even when no commits arrive.
                let _ = inner.indexer.cv.wait_for(&mut ctl, flush_interval);
            }
            if ctl.stop && (failed || tree.ts() >= inner.committed()) {
                break;
            }
        }
        if failed {
            continue;
        }

        if tree.ts() >= inner.committed() {
            if since_flush > 0 && last_flush.elapsed() >= flush_interval {
                if let Err(e) = tree.flush() {
                    error!(error = %e, "index checkpoint failed");
                    *inner.indexer.error.lock() = Some(e.to_string());
                    failed = true;
                }
                since_flush = 0;
                last_flush = Instant::now();
            }
            continue;
        }

        let from = tree.ts() + 1;
        let to = inner.committed();
        match index_range(&inner, &tree, from, to, &mut since_flush) {
            Ok(()) => {
                if since_flush == 0 {
                    last_flush = Instant::now();
                }
            }
            Err(e) => {
                error!(error = %e, from, to, "indexer failed");
                *inner.indexer.error.lock() = Some(e.to_string());
                failed = true;
            }
        }
    }

    if !failed {
        if let Err(e) = tree.flush() {
            warn!(error = %e, "final index flush failed");
            *inner.indexer.error.lock() = Some(e.to_string());
        }
    }
    debug!(ts = tree.ts(), "indexer exited");
}

fn index_range(
    inner: &StoreInner,
    tree: &quiverdb_index::Tree,
    from: u64,
    to: u64,
    since_flush: &mut u64,
) -> Result<()> {
    let mut tx = Tx::with_capacity(inner.caps.max_tx_entries as usize);
    for id in from..=to {
        inner.read_tx_into(id, &mut tx)?;

        let pairs: Vec<(Vec<u8>, Vec<u8>)> =
            tx.entries().iter().map(|e| (e.key().to_vec(), e.locator())).collect();
        tree.insert_batch(&pairs, id)?;

        *since_flush += 1;
        if *since_flush >= inner.flush_threshold() {
            tree.flush()?;
            *since_flush = 0;
        }
    }
    Ok(())
}
