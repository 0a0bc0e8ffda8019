//! Sequential transaction streaming.

use quiverdb_appendable::Appendable;

use crate::{
    error::{Error, Result},
    store::StoreInner,
    tx::Tx,
};

/// Streams committed transactions in id order through a read-ahead buffer.
///
/// Created by [`Store::tx_reader`](crate::Store::tx_reader). `read` returns
/// `Ok(None)` once the last committed transaction has been returned;
/// transactions committed afterwards are picked up by further `read` calls
/// or by a new reader.
pub struct TxReader<'a> {
    inner: &'a StoreInner,
    next_id: u64,
    buf: Vec<u8>,
    /// Tx-log offset of `buf[0]`.
    buf_start: u64,
    buf_len: usize,
    tx: Tx,
}

impl<'a> TxReader<'a> {
    pub(crate) fn new(inner: &'a StoreInner, from_id: u64, buf_size: usize) -> Self {
        Self {
            inner,
            next_id: from_id,
            buf: vec![0u8; buf_size],
            buf_start: 0,
            buf_len: 0,
            tx: Tx::with_capacity(inner.caps.max_tx_entries as usize),
        }
    }

    /// The next committed transaction, or `None` at the end of the stream.
    pub fn read(&mut self) -> Result<Option<&Tx>> {
        if self.inner.closed.load(std::sync::atomic::Ordering::Acquire) {
            return Err(Error::AlreadyClosed);
        }
        if self.next_id > self.inner.committed() {
            return Ok(None);
        }

        let (off, size) = self.inner.read_commit_record_for(self.next_id)?;
        let size = size as usize;

        let buffered = off >= self.buf_start
            && off + size as u64 <= self.buf_start + self.buf_len as u64;
        if !buffered {
            // Refill from this record onward; oversized records grow the
            // buffer for their turn.
            if self.buf.len() < size {
                self.buf.resize(size, 0);
            }
            let got = self.inner.tx_log.read_at(&mut self.buf, off)?;
            if got < size {
                return Err(Error::CorruptedTxData { tx_id: self.next_id });
            }
            self.buf_start = off;
            self.buf_len = got;
        }

        let lo = (off - self.buf_start) as usize;
        self.tx.decode(&self.buf[lo..lo + size], &self.inner.caps)?;
        if self.tx.id != self.next_id {
            return Err(Error::CorruptedTxData { tx_id: self.next_id });
        }
        self.tx.prev_alh = self.inner.alh(self.next_id - 1)?;

        self.next_id += 1;
        Ok(Some(&self.tx))
    }
}
