//! Opening a store: snapshot load, journal scan and recovery.

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::stats::PoolStats;
use crate::storage::LocationGuard;
use crate::store::{decode_image, StoreState};
use crate::transaction::{replay, ManagerOptions, RecoveryReport, TransactionManager};
use crate::wal::{Journal, JournalScan};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{info, warn};

/// An open store: the transaction manager plus the lock on its location.
///
/// Opening runs recovery when the journal shows an unclean shutdown:
///
/// 1. load the snapshot written at the last checkpoint
/// 2. scan the journal; a torn tail is cut off, corruption is fatal
/// 3. replay committed transactions the snapshot does not contain
/// 4. checkpoint, so the recovered store starts clean
///
/// Opening the same unclean location twice (for example on two forks of an
/// in-memory location) gives the same state.
pub struct Database {
    config: Config,
    manager: Arc<TransactionManager>,
    guard: Mutex<Option<LocationGuard>>,
    recovery: Option<RecoveryReport>,
}

impl Database {
    /// Opens the store described by `config`.
    ///
    /// `on_recovery` is called before replay starts, only if replay is needed.
    ///
    /// # Errors
    ///
    /// - `DatabaseLocked` if the location is held by another pool
    /// - `Recovery` if the snapshot or journal cannot be replayed
    pub fn open(
        config: Config,
        stats: Arc<PoolStats>,
        on_recovery: impl FnOnce(),
    ) -> CoreResult<Self> {
        let opened = config.storage.open(config.create_if_missing)?;
        let mut backend = opened.journal;

        let mut state = match opened.snapshots.load()? {
            Some(bytes) => decode_image(&bytes)
                .map_err(|e| CoreError::recovery(format!("unreadable snapshot: {e}")))?,
            None => StoreState::new(),
        };

        let scan = JournalScan::read(backend.as_ref())?;
        if scan.has_torn_tail() {
            warn!(
                valid = scan.valid_len,
                total = scan.total_len,
                "journal has a torn tail, truncating"
            );
            backend
                .truncate(scan.valid_len)
                .map_err(|e| CoreError::recovery(format!("cannot truncate journal: {e}")))?;
        }

        let next_lsn = state.last_commit().max(scan.max_lsn()).next();
        let next_txn = scan
            .entries
            .iter()
            .filter_map(|e| e.txn)
            .map(|t| t.as_u64())
            .max()
            .unwrap_or(0)
            + 1;

        let recovery = if scan.is_clean() {
            None
        } else {
            on_recovery();
            info!(entries = scan.entries.len(), "unclean shutdown detected, recovering");
            let report = replay(&mut state, &scan.entries)?;
            stats.record_recovery();
            Some(report)
        };

        let journal = Journal::new(backend, config.journal_buffer_size, next_lsn)?;
        let manager = Arc::new(TransactionManager::new(
            Arc::new(journal),
            opened.snapshots,
            state,
            next_txn,
            ManagerOptions {
                sync_on_commit: config.sync_on_commit,
                journal_size_limit: config.journal_size_limit,
            },
            stats,
        ));

        if let Some(report) = &recovery {
            manager
                .checkpoint()
                .map_err(|e| CoreError::recovery(format!("post-recovery checkpoint failed: {e}")))?;
            info!(
                replayed = report.replayed,
                skipped = report.skipped,
                discarded = report.discarded,
                last_commit = %report.last_commit,
                "recovery complete"
            );
        }

        Ok(Self {
            config,
            manager,
            guard: Mutex::new(Some(opened.guard)),
            recovery,
        })
    }

    /// Returns the transaction manager.
    #[must_use]
    pub fn manager(&self) -> &Arc<TransactionManager> {
        &self.manager
    }

    /// Returns the configuration the store was opened with.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns what recovery did at open, if it ran.
    #[must_use]
    pub fn recovery(&self) -> Option<RecoveryReport> {
        self.recovery
    }

    /// Returns true until [`Self::close`] has run.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.guard.lock().is_some()
    }

    /// Takes a checkpoint.
    ///
    /// # Errors
    ///
    /// Fails if a transaction is active or the snapshot cannot be written.
    pub fn checkpoint(&self) -> CoreResult<()> {
        self.manager.checkpoint().map(|_| ())
    }

    /// Closes the store and releases its location.
    ///
    /// A clean close checkpoints. With active transactions left, or with
    /// `force_corruption` configured, no checkpoint is written and the next
    /// open recovers; `force_corruption` also skips the final flush.
    ///
    /// # Errors
    ///
    /// Returns the checkpoint or flush error; the location is released anyway.
    pub fn close(&self) -> CoreResult<()> {
        let Some(guard) = self.guard.lock().take() else {
            return Ok(());
        };
        let result = self.manager.close(self.config.force_corruption);
        drop(guard);
        result
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("is_open", &self.is_open())
            .field("manager", &self.manager)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse_document;
    use crate::storage::MemoryStorage;
    use crate::types::DocumentId;
    use crate::wal::JournalRecord;

    fn open(memory: &MemoryStorage) -> Database {
        Database::open(
            Config::new().memory(memory.clone()),
            Arc::new(PoolStats::new()),
            || {},
        )
        .unwrap()
    }

    fn store_one(db: &Database, name: &str) {
        let manager = db.manager();
        let mut txn = manager.begin().unwrap();
        manager
            .log(
                &mut txn,
                JournalRecord::StoreDocument {
                    document: manager.allocate_document_id(),
                    collection: "/db".into(),
                    name: name.into(),
                    owner: "admin".into(),
                    tree: parse_document("<doc/>", false).unwrap(),
                    replace: false,
                },
            )
            .unwrap();
        manager.commit(&mut txn).unwrap();
    }

    #[test]
    fn clean_close_needs_no_recovery() {
        let memory = MemoryStorage::new();
        let db = open(&memory);
        store_one(&db, "a.xml");
        db.close().unwrap();
        assert!(!memory.is_claimed());

        let db = open(&memory);
        assert!(db.recovery().is_none());
        assert!(db.manager().snapshot().document("/db/a.xml").is_some());
    }

    #[test]
    fn crash_recovers_committed_work() {
        let memory = MemoryStorage::new();
        let db = open(&memory);
        store_one(&db, "a.xml");
        drop(db);

        let db = open(&memory);
        let report = db.recovery().unwrap();
        assert_eq!(report.replayed, 1);
        let doc = db.manager().snapshot().document("/db/a.xml").cloned().unwrap();
        assert_eq!(doc.id, DocumentId(1));
    }

    #[test]
    fn recovery_runs_identically_on_forks() {
        let memory = MemoryStorage::new();
        let db = open(&memory);
        store_one(&db, "a.xml");
        store_one(&db, "b.xml");
        drop(db);

        let first = open(&memory.fork());
        let second = open(&memory.fork());
        let paths = |db: &Database| -> Vec<String> {
            db.manager()
                .snapshot()
                .all_documents()
                .iter()
                .map(|d| d.path())
                .collect()
        };
        assert_eq!(paths(&first), paths(&second));
        assert_eq!(paths(&first).len(), 2);
    }

    #[test]
    fn location_is_exclusive() {
        let memory = MemoryStorage::new();
        let _db = open(&memory);
        let err = Database::open(
            Config::new().memory(memory.clone()),
            Arc::new(PoolStats::new()),
            || {},
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::DatabaseLocked));
    }

    #[test]
    fn corrupt_journal_fails_recovery() {
        let memory = MemoryStorage::new();
        let db = open(&memory);
        store_one(&db, "a.xml");
        drop(db);

        memory.journal().corrupt_byte(20).unwrap();
        let err = Database::open(
            Config::new().memory(memory.clone()),
            Arc::new(PoolStats::new()),
            || {},
        )
        .unwrap_err();
        assert!(matches!(err, CoreError::Recovery { .. }));
    }
}
