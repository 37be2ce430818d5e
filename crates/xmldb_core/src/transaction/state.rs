//! Transaction state.

use crate::error::{CoreError, CoreResult};
use crate::store::StoreState;
use crate::transaction::TransactionManager;
use crate::types::{Lsn, TransactionId};
use crate::wal::JournalRecord;
use std::sync::Arc;
use tracing::warn;

/// State of a transaction.
///
/// `Active → Committing → Committed` or `Active → Aborting → Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Transaction is active and can perform operations.
    Active,
    /// Commit is in progress.
    Committing,
    /// Transaction has been committed.
    Committed,
    /// Abort is in progress.
    Aborting,
    /// Transaction has been aborted.
    Aborted,
}

impl TransactionState {
    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Aborted)
    }
}

/// A unit of work.
///
/// Operations are journaled as they are made and applied to a private
/// working copy of the store, so the transaction reads its own writes.
/// Other readers see nothing until commit.
///
/// A transaction dropped while still active is aborted.
pub struct Transaction {
    id: TransactionId,
    begin_lsn: Lsn,
    state: TransactionState,
    /// Journaled operations with their LSNs, in order.
    operations: Vec<(Lsn, JournalRecord)>,
    /// Committed state plus this transaction's operations.
    working: Option<Arc<StoreState>>,
    manager: Arc<TransactionManager>,
}

impl Transaction {
    pub(crate) fn new(id: TransactionId, begin_lsn: Lsn, manager: Arc<TransactionManager>) -> Self {
        Self {
            id,
            begin_lsn,
            state: TransactionState::Active,
            operations: Vec::new(),
            working: None,
            manager,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the LSN of the transaction's begin record.
    #[must_use]
    pub fn begin_lsn(&self) -> Lsn {
        self.begin_lsn
    }

    /// Returns the current state.
    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Checks if the transaction is still active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Returns the number of journaled operations.
    #[must_use]
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Returns the store as this transaction sees it.
    #[must_use]
    pub fn view(&self) -> Arc<StoreState> {
        match &self.working {
            Some(working) => Arc::clone(working),
            None => self.manager.snapshot(),
        }
    }

    pub(crate) fn operations(&self) -> &[(Lsn, JournalRecord)] {
        &self.operations
    }

    /// Applies an already journaled operation to the working copy.
    pub(crate) fn record(&mut self, lsn: Lsn, record: JournalRecord) -> CoreResult<()> {
        let working = self
            .working
            .get_or_insert_with(|| self.manager.snapshot());
        Arc::make_mut(working).apply(&record, lsn)?;
        self.operations.push((lsn, record));
        Ok(())
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Drops the operations and the working copy.
    pub(crate) fn discard(&mut self) {
        self.operations.clear();
        self.working = None;
    }

    /// Ensures the transaction is active.
    pub(crate) fn ensure_active(&self) -> CoreResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committing | TransactionState::Committed => Err(
                CoreError::invalid_operation(format!("transaction {} already committed", self.id)),
            ),
            TransactionState::Aborting | TransactionState::Aborted => Err(
                CoreError::transaction_aborted(format!("transaction {} was aborted", self.id)),
            ),
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(txn = %self.id, "transaction dropped while active, aborting");
            let manager = Arc::clone(&self.manager);
            if let Err(e) = manager.abort(self) {
                warn!(txn = %self.id, error = %e, "abort on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("operations", &self.operations.len())
            .finish_non_exhaustive()
    }
}
