//! Journal writer.

use crate::error::{CoreError, CoreResult};
use crate::types::{Lsn, TransactionId};
use crate::wal::record::{JournalEntry, JournalRecord};
use parking_lot::Mutex;
use tracing::{debug, warn};
use xmldb_storage::{StorageBackend, StorageResult};

/// An encoded entry waiting in the buffer.
struct Pending {
    txn: Option<TransactionId>,
    bytes: Vec<u8>,
}

struct JournalInner {
    backend: Box<dyn StorageBackend>,
    /// Encoded entries not yet handed to the backend, in LSN order.
    pending: Vec<Pending>,
    pending_bytes: usize,
    /// Bytes known to be on the backend.
    written: u64,
    next_lsn: Lsn,
    /// Set when a failed write could not be rolled back.
    broken: bool,
    /// Set once the owning database closed; nothing more is written.
    sealed: bool,
}

/// Append-only journal with an in-memory buffer.
///
/// LSNs are assigned when an entry is written to the buffer, so buffer
/// order is LSN order. The buffer reaches the backend when it grows past
/// the configured size or on [`Journal::flush_to_log`].
///
/// A failed backend write is rolled back by truncating to the last good
/// size, so the on-disk journal never holds a partial batch.
pub struct Journal {
    inner: Mutex<JournalInner>,
    buffer_limit: usize,
}

impl Journal {
    /// Creates a journal over `backend`, whose first new entry gets `next_lsn`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(
        backend: Box<dyn StorageBackend>,
        buffer_limit: usize,
        next_lsn: Lsn,
    ) -> CoreResult<Self> {
        let written = backend.size()?;
        Ok(Self {
            inner: Mutex::new(JournalInner {
                backend,
                pending: Vec::new(),
                pending_bytes: 0,
                written,
                next_lsn: if next_lsn == Lsn::ZERO { Lsn(1) } else { next_lsn },
                broken: false,
                sealed: false,
            }),
            buffer_limit,
        })
    }

    /// Appends a record to the buffer and returns its LSN.
    ///
    /// # Errors
    ///
    /// Returns `JournalWrite` if the buffer had to be written out and the
    /// backend failed.
    pub fn write(&self, txn: Option<TransactionId>, record: JournalRecord) -> CoreResult<Lsn> {
        let mut inner = self.inner.lock();
        Self::ensure_writable(&inner)?;
        let lsn = inner.next_lsn;
        let bytes = JournalEntry { lsn, txn, record }.encode()?;
        inner.next_lsn = lsn.next();
        inner.pending_bytes += bytes.len();
        inner.pending.push(Pending { txn, bytes });

        if inner.pending_bytes >= self.buffer_limit {
            Self::write_out(&mut inner, false)?;
        }
        Ok(lsn)
    }

    /// Writes buffered entries to the backend; with `force` they are also
    /// synced to durable storage.
    ///
    /// # Errors
    ///
    /// Returns `JournalWrite` if the backend fails. The buffer is kept.
    pub fn flush_to_log(&self, force: bool) -> CoreResult<()> {
        let mut inner = self.inner.lock();
        Self::ensure_writable(&inner)?;
        Self::write_out(&mut inner, force)
    }

    /// Refuses all further writes and drops anything still buffered.
    ///
    /// Called once the database has written its final checkpoint or flush.
    pub fn seal(&self) {
        let mut inner = self.inner.lock();
        if !inner.pending.is_empty() {
            debug!(entries = inner.pending.len(), "dropping unflushed entries at seal");
        }
        inner.pending.clear();
        inner.pending_bytes = 0;
        inner.sealed = true;
    }

    /// Returns true once [`Self::seal`] was called.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.inner.lock().sealed
    }

    fn ensure_writable(inner: &JournalInner) -> CoreResult<()> {
        if inner.sealed {
            return Err(CoreError::PoolClosed);
        }
        if inner.broken {
            return Err(CoreError::journal_write("journal is unusable after a failed write"));
        }
        Ok(())
    }

    fn write_out(inner: &mut JournalInner, force: bool) -> CoreResult<()> {
        if !inner.pending.is_empty() {
            let mut batch = Vec::with_capacity(inner.pending_bytes);
            for entry in &inner.pending {
                batch.extend_from_slice(&entry.bytes);
            }
            if let Err(e) = push_batch(inner.backend.as_mut(), &batch, force) {
                Self::roll_back(inner);
                return Err(CoreError::journal_write(e.to_string()));
            }
            inner.written += batch.len() as u64;
            inner.pending.clear();
            inner.pending_bytes = 0;
            return Ok(());
        }

        if force {
            let result = inner.backend.flush().and_then(|()| inner.backend.sync());
            if let Err(e) = result {
                return Err(CoreError::journal_write(e.to_string()));
            }
        }
        Ok(())
    }

    fn roll_back(inner: &mut JournalInner) {
        let good = inner.written;
        if let Err(e) = inner.backend.truncate(good) {
            warn!(error = %e, "journal rollback failed, refusing further writes");
            inner.broken = true;
        }
    }

    /// Drops the buffered entries of `txn`.
    ///
    /// Used after a failed commit so the transaction's commit record never
    /// reaches the backend.
    pub fn discard(&self, txn: TransactionId) {
        let mut inner = self.inner.lock();
        inner.pending.retain(|p| p.txn != Some(txn));
        inner.pending_bytes = inner.pending.iter().map(|p| p.bytes.len()).sum();
    }

    /// Empties the journal and records a checkpoint.
    ///
    /// The caller must have made everything before `last_commit` durable
    /// elsewhere and ensured no transaction is active.
    ///
    /// # Errors
    ///
    /// Returns `JournalWrite` if the journal cannot be truncated or the
    /// checkpoint record cannot be synced.
    pub fn checkpoint(&self, last_commit: Lsn) -> CoreResult<Lsn> {
        let mut inner = self.inner.lock();
        if inner.sealed {
            return Err(CoreError::PoolClosed);
        }
        inner.pending.clear();
        inner.pending_bytes = 0;
        inner
            .backend
            .truncate(0)
            .map_err(|e| CoreError::journal_write(format!("truncate failed: {e}")))?;
        inner.written = 0;
        inner.broken = false;

        let lsn = inner.next_lsn;
        let bytes = JournalEntry {
            lsn,
            txn: None,
            record: JournalRecord::Checkpoint { last_commit },
        }
        .encode()?;
        inner.next_lsn = lsn.next();
        inner.pending_bytes = bytes.len();
        inner.pending.push(Pending { txn: None, bytes });
        Self::write_out(&mut inner, true)?;
        debug!(%lsn, %last_commit, "journal checkpoint written");
        Ok(lsn)
    }

    /// Returns the journal size in bytes, buffered entries included.
    #[must_use]
    pub fn size(&self) -> u64 {
        let inner = self.inner.lock();
        inner.written + inner.pending_bytes as u64
    }

    /// Returns the LSN the next entry will get.
    #[must_use]
    pub fn next_lsn(&self) -> Lsn {
        self.inner.lock().next_lsn
    }

    /// Returns the number of buffered bytes not yet on the backend.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.inner.lock().pending_bytes
    }
}

fn push_batch(backend: &mut dyn StorageBackend, batch: &[u8], force: bool) -> StorageResult<()> {
    backend.append(batch)?;
    if force {
        backend.flush()?;
        backend.sync()?;
    }
    Ok(())
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("buffer_limit", &self.buffer_limit)
            .field("size", &self.size())
            .finish_non_exhaustive()
    }
}
