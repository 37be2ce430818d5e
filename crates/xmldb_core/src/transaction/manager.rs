//! Transaction manager.

use crate::error::{CoreError, CoreResult};
use crate::stats::PoolStats;
use crate::storage::SnapshotStore;
use crate::store::{encode_image, StoreState};
use crate::transaction::state::{Transaction, TransactionState};
use crate::types::{DocumentId, Lsn, TransactionId};
use crate::wal::{Journal, JournalRecord};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Options the manager takes from the pool configuration.
#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    /// Sync the journal on every commit.
    pub sync_on_commit: bool,
    /// Journal size that triggers a checkpoint after a commit.
    pub journal_size_limit: u64,
}

/// Coordinates transactions with the journal and the committed store.
///
/// - every operation is journaled before it touches any state
/// - readers take the committed state as an `Arc<StoreState>` snapshot
///   and never see a partially applied transaction
/// - commits are serialized by the commit lock; commit order is the order
///   of commit LSNs, which recovery reproduces
///
/// Lock order: commit lock, then the active set.
pub struct TransactionManager {
    journal: Arc<Journal>,
    snapshots: Box<dyn SnapshotStore>,
    /// The committed state.
    state: RwLock<Arc<StoreState>>,
    next_txn: AtomicU64,
    next_document: AtomicU64,
    commit_lock: Mutex<()>,
    active: Mutex<BTreeSet<TransactionId>>,
    /// Signalled whenever the active set shrinks.
    idle: Condvar,
    options: ManagerOptions,
    stats: Arc<PoolStats>,
}

impl TransactionManager {
    /// Creates a manager over a recovered state.
    pub fn new(
        journal: Arc<Journal>,
        snapshots: Box<dyn SnapshotStore>,
        state: StoreState,
        next_txn: u64,
        options: ManagerOptions,
        stats: Arc<PoolStats>,
    ) -> Self {
        Self {
            journal,
            snapshots,
            next_document: AtomicU64::new(state.next_document_id()),
            state: RwLock::new(Arc::new(state)),
            next_txn: AtomicU64::new(next_txn.max(1)),
            commit_lock: Mutex::new(()),
            active: Mutex::new(BTreeSet::new()),
            idle: Condvar::new(),
            options,
            stats,
        }
    }

    /// Begins a transaction.
    ///
    /// # Errors
    ///
    /// Returns `JournalWrite` if the begin record cannot be journaled.
    pub fn begin(self: &Arc<Self>) -> CoreResult<Transaction> {
        let id = TransactionId::new(self.next_txn.fetch_add(1, Ordering::SeqCst));
        let lsn = self.journal.write(Some(id), JournalRecord::Begin)?;
        self.active.lock().insert(id);
        self.stats.record_transaction_start();
        debug!(txn = %id, %lsn, "transaction started");
        Ok(Transaction::new(id, lsn, Arc::clone(self)))
    }

    /// Journals a mutation for `txn` and applies it to the transaction's view.
    ///
    /// The record is checked against the view first; a record that cannot
    /// apply fails without being journaled and leaves the transaction
    /// active. A journal failure aborts the transaction.
    ///
    /// # Errors
    ///
    /// - the data errors of [`StoreState::check`]
    /// - `JournalWrite` if the journal fails
    /// - `InvalidOperation` / `TransactionAborted` if `txn` is not active
    pub fn log(&self, txn: &mut Transaction, record: JournalRecord) -> CoreResult<Lsn> {
        txn.ensure_active()?;
        txn.view().check(&record)?;

        let lsn = match self.journal.write(Some(txn.id()), record.clone()) {
            Ok(lsn) => lsn,
            Err(e) => {
                warn!(txn = %txn.id(), error = %e, "journal write failed, aborting");
                self.abort(txn)?;
                return Err(e);
            }
        };
        if let Err(e) = txn.record(lsn, record) {
            self.abort(txn)?;
            return Err(e);
        }
        Ok(lsn)
    }

    /// Commits a transaction and returns its commit LSN.
    ///
    /// The transaction's operations are applied to the latest committed
    /// state, the commit record is forced to the journal, and only then is
    /// the new state published. If anything fails the transaction is
    /// aborted and the error returned.
    ///
    /// # Errors
    ///
    /// - `JournalWrite` if the commit record cannot be made durable
    /// - the data errors of [`StoreState::apply`] if a concurrent commit
    ///   made an operation invalid
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        txn.ensure_active()?;
        txn.set_state(TransactionState::Committing);
        let id = txn.id();

        let guard = self.commit_lock.lock();
        let mut next = StoreState::clone(&self.snapshot());
        let applied = txn
            .operations()
            .iter()
            .try_for_each(|(lsn, record)| next.apply(record, *lsn));
        if let Err(e) = applied {
            drop(guard);
            debug!(txn = %id, error = %e, "commit conflict");
            self.abort(txn)?;
            return Err(e);
        }

        let written = self
            .journal
            .write(Some(id), JournalRecord::Commit)
            .and_then(|lsn| {
                self.journal
                    .flush_to_log(self.options.sync_on_commit)
                    .map(|()| lsn)
            });
        let commit_lsn = match written {
            Ok(lsn) => lsn,
            Err(e) => {
                drop(guard);
                warn!(txn = %id, error = %e, "commit could not be made durable, aborting");
                self.journal.discard(id);
                self.abort(txn)?;
                if matches!(e, CoreError::PoolClosed) {
                    return Err(e);
                }
                return Err(CoreError::journal_write(format!(
                    "commit of {id} failed: {e}"
                )));
            }
        };

        next.set_last_commit(commit_lsn);
        *self.state.write() = Arc::new(next);
        txn.set_state(TransactionState::Committed);
        txn.discard();
        self.finish(id);
        self.stats.record_transaction_commit();
        debug!(txn = %id, lsn = %commit_lsn, "transaction committed");
        drop(guard);

        self.maybe_checkpoint();
        Ok(commit_lsn)
    }

    /// Aborts a transaction, discarding its operations.
    ///
    /// Aborting an aborted transaction does nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if the transaction already committed.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        match txn.state() {
            TransactionState::Aborted => return Ok(()),
            TransactionState::Committed => {
                return Err(CoreError::invalid_operation(format!(
                    "transaction {} already committed",
                    txn.id()
                )))
            }
            _ => {}
        }
        let id = txn.id();
        txn.set_state(TransactionState::Aborting);
        if let Err(e) = self.journal.write(Some(id), JournalRecord::Abort) {
            // Without the record the transaction still has no commit and is
            // dropped by recovery.
            warn!(txn = %id, error = %e, "abort record not journaled");
        }
        txn.discard();
        txn.set_state(TransactionState::Aborted);
        self.finish(id);
        self.stats.record_transaction_abort();
        debug!(txn = %id, "transaction aborted");
        Ok(())
    }

    fn finish(&self, id: TransactionId) {
        let mut active = self.active.lock();
        active.remove(&id);
        if active.is_empty() {
            self.idle.notify_all();
        }
    }

    /// Returns the committed state.
    #[must_use]
    pub fn snapshot(&self) -> Arc<StoreState> {
        Arc::clone(&self.state.read())
    }

    /// Allocates a document id no other document will get.
    pub fn allocate_document_id(&self) -> DocumentId {
        DocumentId(self.next_document.fetch_add(1, Ordering::SeqCst))
    }

    /// Writes the committed state as the snapshot and empties the journal.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if a transaction is active
    /// - `JournalWrite` or I/O errors from the snapshot store
    pub fn checkpoint(&self) -> CoreResult<Lsn> {
        let _guard = self.commit_lock.lock();
        let active = self.active.lock();
        if !active.is_empty() {
            return Err(CoreError::invalid_operation(format!(
                "cannot checkpoint with {} active transaction(s)",
                active.len()
            )));
        }
        self.checkpoint_locked()
    }

    /// Writes the final state and seals the journal.
    ///
    /// With nothing active the store is checkpointed; otherwise the journal
    /// is only flushed and the active transactions are left for recovery.
    /// `skip_durability` skips both, leaving everything for recovery. Once
    /// this returns, commits and journal writes fail with `PoolClosed`.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint or flush error; the journal is sealed anyway.
    pub fn close(&self, skip_durability: bool) -> CoreResult<()> {
        let _guard = self.commit_lock.lock();
        if self.journal.is_sealed() {
            return Ok(());
        }
        let active = self.active.lock();
        let result = if skip_durability {
            warn!("closing without checkpoint: force_corruption is set");
            Ok(())
        } else if !active.is_empty() {
            warn!(
                active = active.len(),
                "closing with active transactions, store left for recovery"
            );
            self.journal.flush_to_log(true)
        } else {
            self.checkpoint_locked().map(|_| ())
        };
        self.journal.seal();
        result
    }

    /// Takes a checkpoint if the journal outgrew its limit and nothing is active.
    fn maybe_checkpoint(&self) {
        if self.journal.size() <= self.options.journal_size_limit {
            return;
        }
        let _guard = self.commit_lock.lock();
        let active = self.active.lock();
        if !active.is_empty() {
            return;
        }
        if let Err(e) = self.checkpoint_locked() {
            warn!(error = %e, "automatic checkpoint failed");
        }
    }

    fn checkpoint_locked(&self) -> CoreResult<Lsn> {
        let state = self.snapshot();
        let image = encode_image(&state)?;
        self.snapshots.replace(&image)?;
        let lsn = self.journal.checkpoint(state.last_commit())?;
        self.stats.record_checkpoint();
        info!(
            %lsn,
            last_commit = %state.last_commit(),
            documents = state.all_documents().len(),
            "checkpoint complete"
        );
        Ok(lsn)
    }

    /// Writes buffered journal entries out; with `force` also syncs them.
    ///
    /// # Errors
    ///
    /// Returns `JournalWrite` if the journal fails.
    pub fn flush_to_log(&self, force: bool) -> CoreResult<()> {
        self.journal.flush_to_log(force)
    }

    /// Returns true if `id` is an active transaction.
    #[must_use]
    pub fn is_active(&self, id: TransactionId) -> bool {
        self.active.lock().contains(&id)
    }

    /// Returns the number of active transactions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Waits until no transaction is active. Returns false on timeout.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut active = self.active.lock();
        while !active.is_empty() {
            if self.idle.wait_until(&mut active, deadline).timed_out() {
                return active.is_empty();
            }
        }
        true
    }

    /// Returns the journal.
    #[must_use]
    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active", &self.active_count())
            .field("last_commit", &self.snapshot().last_commit())
            .field("journal", &self.journal)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse_document;
    use crate::storage::MemoryStorage;
    use crate::wal::JournalScan;
    use xmldb_storage::{FaultInjector, FaultyBackend, InMemoryBackend};

    struct Fixture {
        manager: Arc<TransactionManager>,
        backend: InMemoryBackend,
        faults: FaultInjector,
        snapshots: MemoryStorage,
    }

    fn fixture(limit: u64) -> Fixture {
        let backend = InMemoryBackend::new();
        let faults = FaultInjector::new();
        let journal = Journal::new(
            Box::new(FaultyBackend::new(backend.clone(), faults.clone())),
            1 << 20,
            Lsn(1),
        )
        .unwrap();
        let snapshots = MemoryStorage::new();
        let manager = Arc::new(TransactionManager::new(
            Arc::new(journal),
            Box::new(snapshots.clone()),
            StoreState::new(),
            1,
            ManagerOptions {
                sync_on_commit: true,
                journal_size_limit: limit,
            },
            Arc::new(PoolStats::new()),
        ));
        Fixture {
            manager,
            backend,
            faults,
            snapshots,
        }
    }

    fn store(manager: &TransactionManager, name: &str, xml: &str) -> JournalRecord {
        JournalRecord::StoreDocument {
            document: manager.allocate_document_id(),
            collection: "/db".into(),
            name: name.into(),
            owner: "admin".into(),
            tree: parse_document(xml, false).unwrap(),
            replace: false,
        }
    }

    #[test]
    fn commit_publishes_and_reads_own_writes() {
        let f = fixture(u64::MAX);
        let mut txn = f.manager.begin().unwrap();
        f.manager
            .log(&mut txn, store(&f.manager, "a.xml", "<a/>"))
            .unwrap();

        assert!(txn.view().document("/db/a.xml").is_some());
        assert!(f.manager.snapshot().document("/db/a.xml").is_none());

        let lsn = f.manager.commit(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(f.manager.snapshot().last_commit(), lsn);
        assert!(f.manager.snapshot().document("/db/a.xml").is_some());
        assert_eq!(f.manager.active_count(), 0);
    }

    #[test]
    fn abort_is_idempotent_and_discards() {
        let f = fixture(u64::MAX);
        let mut txn = f.manager.begin().unwrap();
        f.manager
            .log(&mut txn, store(&f.manager, "a.xml", "<a/>"))
            .unwrap();
        f.manager.abort(&mut txn).unwrap();
        f.manager.abort(&mut txn).unwrap();

        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(f.manager.snapshot().document("/db/a.xml").is_none());
        let err = f.manager.commit(&mut txn).unwrap_err();
        assert!(matches!(err, CoreError::TransactionAborted { .. }));
    }

    #[test]
    fn failed_commit_flush_aborts_and_leaves_no_commit_record() {
        let f = fixture(u64::MAX);
        let mut txn = f.manager.begin().unwrap();
        f.manager
            .log(&mut txn, store(&f.manager, "a.xml", "<a/>"))
            .unwrap();

        f.faults.fail_flushes(true);
        let err = f.manager.commit(&mut txn).unwrap_err();
        assert!(matches!(err, CoreError::JournalWrite { .. }));
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(f.manager.snapshot().document("/db/a.xml").is_none());

        f.faults.reset();
        f.manager.flush_to_log(true).unwrap();
        let scan = JournalScan::read(&f.backend).unwrap();
        assert!(!scan
            .entries
            .iter()
            .any(|e| matches!(e.record, JournalRecord::Commit)));
    }

    #[test]
    fn invalid_operation_is_not_journaled() {
        let f = fixture(u64::MAX);
        let mut txn = f.manager.begin().unwrap();
        let err = f
            .manager
            .log(
                &mut txn,
                JournalRecord::RemoveDocument {
                    collection: "/db".into(),
                    name: "nope.xml".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(err, CoreError::DocumentNotFound { .. }));
        assert!(txn.is_active());
        assert_eq!(txn.operation_count(), 0);
    }

    #[test]
    fn concurrent_conflict_aborts_the_later_commit() {
        let f = fixture(u64::MAX);
        let mut first = f.manager.begin().unwrap();
        let mut second = f.manager.begin().unwrap();
        f.manager
            .log(&mut first, store(&f.manager, "same.xml", "<a/>"))
            .unwrap();
        f.manager
            .log(&mut second, store(&f.manager, "same.xml", "<b/>"))
            .unwrap();

        f.manager.commit(&mut first).unwrap();
        let err = f.manager.commit(&mut second).unwrap_err();
        assert!(matches!(err, CoreError::DocumentExists { .. }));
        assert_eq!(second.state(), TransactionState::Aborted);
    }

    #[test]
    fn checkpoint_requires_no_active_transactions() {
        let f = fixture(u64::MAX);
        let txn = f.manager.begin().unwrap();
        assert!(f.manager.checkpoint().is_err());
        drop(txn);
        assert!(f.manager.wait_idle(Duration::from_millis(10)));
        f.manager.checkpoint().unwrap();
        assert!(f.snapshots.load().unwrap().is_some());
        assert!(JournalScan::read(&f.backend).unwrap().is_clean());
    }

    #[test]
    fn oversized_journal_triggers_checkpoint() {
        let f = fixture(1);
        let mut txn = f.manager.begin().unwrap();
        f.manager
            .log(&mut txn, store(&f.manager, "a.xml", "<a/>"))
            .unwrap();
        f.manager.commit(&mut txn).unwrap();

        assert!(f.snapshots.load().unwrap().is_some());
        assert_eq!(JournalScan::read(&f.backend).unwrap().entries.len(), 1);
    }

    #[test]
    fn commit_after_close_fails_with_pool_closed() {
        let f = fixture(u64::MAX);
        let mut txn = f.manager.begin().unwrap();
        f.manager
            .log(&mut txn, store(&f.manager, "late.xml", "<a/>"))
            .unwrap();
        f.manager.close(false).unwrap();

        let err = f.manager.commit(&mut txn).unwrap_err();
        assert!(matches!(err, CoreError::PoolClosed), "{err:?}");
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(f.manager.snapshot().document("/db/late.xml").is_none());
        assert!(matches!(f.manager.begin(), Err(CoreError::PoolClosed)));
        assert!(!JournalScan::read(&f.backend)
            .unwrap()
            .entries
            .iter()
            .any(|e| matches!(e.record, JournalRecord::Commit)));
    }

    #[test]
    fn wait_idle_times_out_while_active() {
        let f = fixture(u64::MAX);
        let _txn = f.manager.begin().unwrap();
        assert!(!f.manager.wait_idle(Duration::from_millis(5)));
    }
}
