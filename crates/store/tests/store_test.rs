//! End-to-end store scenarios: round-trips across reopen, crash-safe torn
//! tails under fault injection, proof verification at scale, concurrent
//! writers and readers, and historical index queries.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use quiverdb_appendable::{multi, Appendable, CompressionFormat, MultiAppendable};
use quiverdb_store::{
    verify_dual_proof, verify_linear_proof, Error, Options, Store, KV,
};
use rand::Rng;
use tempfile::tempdir;

fn kvs_for_tx(i: u64, ecount: u64) -> Vec<KV> {
    (0..ecount)
        .map(|j| {
            KV::new(
                ((i << 4) + j).to_be_bytes().to_vec(),
                ((i << 4) + (ecount - j)).to_be_bytes().to_vec(),
            )
        })
        .collect()
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in {timeout:?}");
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Scenario 1: commit, close, reopen, stream back, verify every inclusion
/// proof and every value.
#[test]
fn test_round_trip_across_reopen() {
    let dir = tempdir().unwrap();
    let tx_count = 32u64;
    let ecount = 100u64;

    {
        let store = Store::open(dir.path(), Options::default()).unwrap();
        for i in 0..tx_count {
            let summary = store.commit(&kvs_for_tx(i, ecount)).unwrap();
            assert_eq!(summary.id, i + 1);
            assert_eq!(summary.nentries, ecount as u32);
        }
        store.sync().unwrap();
        store.close().unwrap();

        assert!(matches!(
            store.commit(&[KV::new(b"k".to_vec(), b"v".to_vec())]),
            Err(Error::AlreadyClosed)
        ));
    }

    let store = Store::open(dir.path(), Options::default()).unwrap();
    assert_eq!(store.tx_count().unwrap(), tx_count);

    let mut reader = store.tx_reader(1, 1024).unwrap();
    for i in 0..tx_count {
        let tx = reader.read().unwrap().expect("tx expected");
        assert_eq!(tx.id, i + 1);
        assert_eq!(tx.nentries(), ecount as u32);

        let eh = tx.eh();
        // Collect what's needed so values can be read after the borrow ends.
        let entries: Vec<_> = tx
            .entries()
            .iter()
            .map(|e| (e.key().to_vec(), e.value_len, e.v_off, e.h_value, e.digest()))
            .collect();
        let proofs: Vec<_> = (0..ecount as usize).map(|j| tx.proof(j).unwrap()).collect();

        for (j, ((key, value_len, v_off, h_value, digest), proof)) in
            entries.iter().zip(&proofs).enumerate()
        {
            assert_eq!(key, &((i << 4) + j as u64).to_be_bytes().to_vec());

            let mut value = vec![0u8; *value_len as usize];
            store.read_value_at(&mut value, *v_off, *h_value).unwrap();
            assert_eq!(value, ((i << 4) + (ecount - j as u64)).to_be_bytes().to_vec());

            assert!(proof.verify(*digest, eh), "inclusion {i}/{j}");
        }
    }
    assert!(reader.read().unwrap().is_none());

    // read_value agrees with read_value_at.
    let mut tx = store.new_tx();
    store.read_tx(5, &mut tx).unwrap();
    let key = ((4u64 << 4) + 3).to_be_bytes();
    assert_eq!(
        store.read_value(&tx, &key).unwrap(),
        ((4u64 << 4) + (ecount - 3)).to_be_bytes().to_vec()
    );

    store.close().unwrap();
}

/// Scenario 2: validation errors return without side effects.
#[test]
fn test_validation() {
    let dir = tempdir().unwrap();
    let store = Store::open(dir.path(), Options::default().with_synced(false)).unwrap();

    assert!(matches!(store.commit(&[]), Err(Error::NoEntriesProvided)));
    assert!(matches!(
        store.commit(&[
            KV::new(b"key".to_vec(), b"value".to_vec()),
            KV::new(b"key".to_vec(), b"value".to_vec()),
        ]),
        Err(Error::DuplicatedKey)
    ));
    assert_eq!(store.tx_count().unwrap(), 0);

    store.close().unwrap();
    assert!(matches!(
        store.commit(&[KV::new(b"k".to_vec(), b"v".to_vec())]),
        Err(Error::AlreadyClosed)
    ));
}

/// Appendable wrapper failing `append` at a fixed percentage rate.
struct FailingAppendable {
    inner: Arc<dyn Appendable>,
    error_rate: u32,
}

impl FailingAppendable {
    fn new(inner: Arc<dyn Appendable>, error_rate: u32) -> Arc<dyn Appendable> {
        Arc::new(Self { inner, error_rate })
    }
}

impl Appendable for FailingAppendable {
    fn metadata(&self) -> Vec<u8> {
        self.inner.metadata()
    }

    fn size(&self) -> quiverdb_appendable::Result<u64> {
        self.inner.size()
    }

    fn append(&self, data: &[u8]) -> quiverdb_appendable::Result<(u64, usize)> {
        if rand::thread_rng().gen_range(0..100) < self.error_rate {
            return Err(quiverdb_appendable::Error::Io {
                source: std::io::Error::other("emulated appendable error"),
            });
        }
        self.inner.append(data)
    }

    fn read_at(&self, buf: &mut [u8], offset: u64) -> quiverdb_appendable::Result<usize> {
        self.inner.read_at(buf, offset)
    }

    fn set_offset(&self, offset: u64) -> quiverdb_appendable::Result<()> {
        self.inner.set_offset(offset)
    }

    fn flush(&self) -> quiverdb_appendable::Result<()> {
        self.inner.flush()
    }

    fn sync(&self) -> quiverdb_appendable::Result<()> {
        self.inner.sync()
    }

    fn close(&self) -> quiverdb_appendable::Result<()> {
        self.inner.close()
    }
}

/// Scenario 3: random append failures leave a recoverable store whose
/// committed prefix fully verifies.
#[test]
fn test_uncommitted_tx_overwriting() {
    let dir = tempdir().unwrap();
    let opts = Options::default();

    let log_opts = |ext: &str| {
        multi::Options::default()
            .with_file_size(opts.file_size)
            .with_file_ext(ext)
            .with_metadata(opts.log_metadata())
    };
    let v_log: Arc<dyn Appendable> = Arc::new(
        MultiAppendable::open(dir.path().join("val_0"), log_opts("val")).unwrap(),
    );
    let tx_log: Arc<dyn Appendable> =
        Arc::new(MultiAppendable::open(dir.path().join("tx"), log_opts("tx")).unwrap());
    let c_log: Arc<dyn Appendable> =
        Arc::new(MultiAppendable::open(dir.path().join("commit"), log_opts("txi")).unwrap());

    let store = Store::open_with(
        vec![FailingAppendable::new(v_log, 2)],
        FailingAppendable::new(tx_log, 5),
        FailingAppendable::new(c_log, 5),
        opts.clone(),
    )
    .unwrap();

    let tx_count = 100u64;
    let ecount = 64u64;
    let mut failures = 0u64;

    for i in 0..tx_count {
        let entries: Vec<KV> = (0..ecount)
            .map(|j| {
                KV::new((j as u32).to_be_bytes().to_vec(), (j + 1).to_be_bytes().to_vec())
            })
            .collect();
        match store.commit(&entries) {
            Ok(summary) => assert_eq!(summary.id, i + 1 - failures),
            Err(_) => failures += 1,
        }
    }
    store.close().unwrap();

    // Reopen over the real logs; torn tails are truncated away.
    let store = Store::open(dir.path(), opts).unwrap();
    assert_eq!(store.tx_count().unwrap(), tx_count - failures);

    let mut reader = store.tx_reader(1, 1024).unwrap();
    for _ in 0..(tx_count - failures) {
        let tx = reader.read().unwrap().expect("committed tx expected");
        assert_eq!(tx.nentries(), ecount as u32);

        let eh = tx.eh();
        let entries: Vec<_> = tx
            .entries()
            .iter()
            .map(|e| (e.value_len, e.v_off, e.h_value, e.digest()))
            .collect();
        let proofs: Vec<_> = (0..ecount as usize).map(|j| tx.proof(j).unwrap()).collect();

        for ((value_len, v_off, h_value, digest), proof) in entries.iter().zip(&proofs) {
            let mut value = vec![0u8; *value_len as usize];
            store.read_value_at(&mut value, *v_off, *h_value).unwrap();
            assert!(proof.verify(*digest, eh));
        }
    }
    assert!(reader.read().unwrap().is_none());

    store.close().unwrap();
}

/// Scenario 4: dual proofs verify for every ordered pair, in both
/// directions.
#[test]
fn test_dual_proof_all_pairs() {
    let dir = tempdir().unwrap();
    let tx_count = 32u64;

    let store = Store::open(dir.path(), Options::default().with_synced(false)).unwrap();
    for i in 0..tx_count {
        store.commit(&kvs_for_tx(i, 100)).unwrap();
    }

    for i in 1..=tx_count {
        let alh_i = store.alh(i).unwrap();
        for j in (i + 1)..=tx_count {
            let alh_j = store.alh(j).unwrap();

            let proof = store.dual_proof(i, j).unwrap();
            assert!(verify_dual_proof(&proof, i, j, alh_i, alh_j), "dual {i}->{j}");
            assert!(verify_dual_proof(&proof, j, i, alh_j, alh_i), "dual {j}->{i}");

            let lproof = store.linear_proof(i, j).unwrap();
            assert!(verify_linear_proof(&lproof, i, j, alh_i, alh_j), "linear {i}->{j}");
        }
    }

    store.close().unwrap();
}

/// Scenario 5: a reader polling the log observes every transaction id in
/// order while a writer commits.
#[test]
fn test_concurrent_writer_and_reader() {
    let dir = tempdir().unwrap();
    let tx_count = 100u64;
    let ecount = 1000u64;

    let store = Arc::new(Store::open(dir.path(), Options::default().with_synced(false)).unwrap());

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..tx_count {
                let entries: Vec<KV> = (0..ecount)
                    .map(|j| KV::new(j.to_be_bytes().to_vec(), i.to_be_bytes().to_vec()))
                    .collect();
                let summary = store.commit(&entries).unwrap();
                assert_eq!(summary.id, i + 1);
            }
        })
    };

    let observer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            let mut expected = 1u64;
            loop {
                std::thread::sleep(Duration::from_millis(100));

                let mut reader = store.tx_reader(expected, 4096).unwrap();
                while let Some(tx) = reader.read().unwrap() {
                    assert_eq!(tx.id, expected, "ids must be dense and in order");
                    expected += 1;
                }
                if expected > tx_count {
                    break;
                }
            }
        })
    };

    writer.join().unwrap();
    observer.join().unwrap();
    store.close().unwrap();
}

/// Scenario 6: once the indexer catches up, every key reports its complete
/// history, newest first, and each historical value reads back from the
/// transaction log.
#[test]
fn test_historical_index_queries() {
    let dir = tempdir().unwrap();
    let tx_count = 10u64;
    let ecount = 100u64;

    let store = Store::open(dir.path(), Options::default().with_synced(false)).unwrap();
    for i in 0..tx_count {
        let entries: Vec<KV> = (0..ecount)
            .map(|j| KV::new(j.to_be_bytes().to_vec(), i.to_be_bytes().to_vec()))
            .collect();
        store.commit(&entries).unwrap();
    }

    wait_until(Duration::from_secs(30), || store.index_info().unwrap() >= tx_count);

    let snap1 = store.snapshot().unwrap();
    let snap2 = store.snapshot().unwrap();
    assert!(snap2.ts() >= snap1.ts(), "snapshot ts must be monotone");
    assert_eq!(snap2.ts(), tx_count);

    let mut tx = store.new_tx();
    for j in 0..ecount {
        let key = j.to_be_bytes();

        // Latest value through the index: a locator into the value log.
        let (locator, ts) = snap2.get(&key).unwrap();
        assert_eq!(ts, tx_count);
        assert_eq!(locator.len(), 44);
        let value_len = u32::from_be_bytes(locator[0..4].try_into().unwrap());
        let v_off = u64::from_be_bytes(locator[4..12].try_into().unwrap());
        let mut h_value = [0u8; 32];
        h_value.copy_from_slice(&locator[12..44]);

        let mut value = vec![0u8; value_len as usize];
        store.read_value_at(&mut value, v_off, h_value).unwrap();
        assert_eq!(value, (tx_count - 1).to_be_bytes().to_vec());

        // Complete history, newest first; values read back via the tx log.
        let tx_ids = snap2.get_ts(&key, tx_count as usize).unwrap();
        assert_eq!(tx_ids, (1..=tx_count).rev().collect::<Vec<_>>());

        for tx_id in tx_ids {
            store.read_tx(tx_id, &mut tx).unwrap();
            let value = store.read_value(&tx, &key).unwrap();
            assert_eq!(value, (tx_id - 1).to_be_bytes().to_vec());
        }
    }

    store.close().unwrap();
}

/// Scenario 7: gzip-compressed logs stay dense and verifiable across three
/// open/commit/close cycles.
#[test]
fn test_compression_across_reopen_cycles() {
    let dir = tempdir().unwrap();
    let cycles = 3u64;
    let tx_per_cycle = 100u64;
    let ecount = 10u64;

    let opts = Options::default()
        .with_synced(false)
        .with_compression_format(CompressionFormat::Gzip);

    for cycle in 0..cycles {
        let store = Store::open(dir.path(), opts.clone()).unwrap();
        for i in 0..tx_per_cycle {
            let summary = store.commit(&kvs_for_tx(i, ecount)).unwrap();
            assert_eq!(summary.id, cycle * tx_per_cycle + i + 1, "ids stay dense");
        }
        store.close().unwrap();
    }

    let store = Store::open(dir.path(), opts).unwrap();
    assert_eq!(store.tx_count().unwrap(), cycles * tx_per_cycle);

    let mut reader = store.tx_reader(1, 4096).unwrap();
    for id in 1..=(cycles * tx_per_cycle) {
        let tx = reader.read().unwrap().expect("tx expected");
        assert_eq!(tx.id, id);

        let eh = tx.eh();
        let digests: Vec<_> = tx.entries().iter().map(|e| e.digest()).collect();
        for (j, digest) in digests.iter().enumerate() {
            assert!(tx.proof(j).unwrap().verify(*digest, eh), "inclusion {id}/{j}");
        }
    }
    assert!(reader.read().unwrap().is_none());

    store.close().unwrap();
}
