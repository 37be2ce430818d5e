//! Journal replay.

use crate::error::{CoreError, CoreResult};
use crate::store::StoreState;
use crate::types::{Lsn, TransactionId};
use crate::wal::{JournalEntry, JournalRecord};
use std::collections::{BTreeMap, HashMap};

/// What a replay did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecoveryReport {
    /// Committed transactions re-applied.
    pub replayed: usize,
    /// Committed transactions already contained in the snapshot.
    pub skipped: usize,
    /// Transactions without a commit record, dropped.
    pub discarded: usize,
    /// Commit LSN of the state after replay.
    pub last_commit: Lsn,
}

/// Re-applies the committed transactions of `entries` onto `state`.
///
/// Transactions are applied in commit-LSN order, which is the order they
/// were applied live; each transaction's mutations in LSN order. Commits at
/// or below the state's last commit are already contained in it and are
/// skipped, so replaying the same journal twice gives the same state.
///
/// # Errors
///
/// Returns `Recovery` if a committed operation cannot be applied.
pub fn replay(state: &mut StoreState, entries: &[JournalEntry]) -> CoreResult<RecoveryReport> {
    let mut operations: HashMap<TransactionId, Vec<&JournalEntry>> = HashMap::new();
    let mut commits: BTreeMap<Lsn, TransactionId> = BTreeMap::new();
    let mut seen: Vec<TransactionId> = Vec::new();

    for entry in entries {
        let Some(txn) = entry.txn else {
            continue;
        };
        if !seen.contains(&txn) {
            seen.push(txn);
        }
        match &entry.record {
            JournalRecord::Commit => {
                commits.insert(entry.lsn, txn);
            }
            JournalRecord::Abort => {
                operations.remove(&txn);
            }
            record if record.is_mutation() => operations.entry(txn).or_default().push(entry),
            _ => {}
        }
    }

    let mut report = RecoveryReport {
        discarded: seen.len().saturating_sub(commits.len()),
        ..RecoveryReport::default()
    };
    let base = state.last_commit();

    for (commit_lsn, txn) in commits {
        if commit_lsn <= base {
            report.skipped += 1;
            continue;
        }
        let mut ops = operations.remove(&txn).unwrap_or_default();
        ops.sort_by_key(|e| e.lsn);
        for entry in ops {
            state.apply(&entry.record, entry.lsn).map_err(|e| {
                CoreError::recovery(format!("cannot replay {txn} at {}: {e}", entry.lsn))
            })?;
        }
        state.set_last_commit(commit_lsn);
        report.replayed += 1;
    }

    report.last_commit = state.last_commit();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::parse_document;
    use crate::types::DocumentId;

    fn entry(lsn: u64, txn: u64, record: JournalRecord) -> JournalEntry {
        JournalEntry {
            lsn: Lsn(lsn),
            txn: Some(TransactionId::new(txn)),
            record,
        }
    }

    fn store(id: u64, name: &str, xml: &str) -> JournalRecord {
        JournalRecord::StoreDocument {
            document: DocumentId(id),
            collection: "/db".into(),
            name: name.into(),
            owner: "admin".into(),
            tree: parse_document(xml, false).unwrap(),
            replace: true,
        }
    }

    #[test]
    fn only_committed_transactions_are_applied() {
        let entries = vec![
            entry(1, 1, JournalRecord::Begin),
            entry(2, 1, store(1, "kept.xml", "<a/>")),
            entry(3, 2, JournalRecord::Begin),
            entry(4, 2, store(2, "lost.xml", "<b/>")),
            entry(5, 1, JournalRecord::Commit),
            entry(6, 3, JournalRecord::Begin),
            entry(7, 3, store(3, "aborted.xml", "<c/>")),
            entry(8, 3, JournalRecord::Abort),
        ];
        let mut state = StoreState::new();
        let report = replay(&mut state, &entries).unwrap();

        assert_eq!(report.replayed, 1);
        assert_eq!(report.discarded, 2);
        assert_eq!(report.last_commit, Lsn(5));
        assert!(state.document("/db/kept.xml").is_some());
        assert!(state.document("/db/lost.xml").is_none());
        assert!(state.document("/db/aborted.xml").is_none());
    }

    #[test]
    fn commit_order_decides_the_winner() {
        // txn 2 began later but committed first; txn 1's version must win.
        let entries = vec![
            entry(1, 1, JournalRecord::Begin),
            entry(2, 2, JournalRecord::Begin),
            entry(3, 1, store(1, "d.xml", "<first/>")),
            entry(4, 2, store(2, "d.xml", "<second/>")),
            entry(5, 2, JournalRecord::Commit),
            entry(6, 1, JournalRecord::Commit),
        ];
        let mut state = StoreState::new();
        replay(&mut state, &entries).unwrap();
        assert_eq!(state.document("/db/d.xml").unwrap().id, DocumentId(1));
    }

    #[test]
    fn replay_is_idempotent() {
        let entries = vec![
            entry(1, 1, JournalRecord::Begin),
            entry(2, 1, store(1, "d.xml", "<a/>")),
            entry(3, 1, JournalRecord::Commit),
        ];
        let mut state = StoreState::new();
        replay(&mut state, &entries).unwrap();
        let again = replay(&mut state, &entries).unwrap();
        assert_eq!(again.replayed, 0);
        assert_eq!(again.skipped, 1);
        assert_eq!(state.all_documents().len(), 1);
    }

    #[test]
    fn unreplayable_commit_is_a_recovery_error() {
        let entries = vec![
            entry(1, 1, JournalRecord::Begin),
            entry(
                2,
                1,
                JournalRecord::RemoveDocument {
                    collection: "/db".into(),
                    name: "missing.xml".into(),
                },
            ),
            entry(3, 1, JournalRecord::Commit),
        ];
        let err = replay(&mut StoreState::new(), &entries).unwrap_err();
        assert!(matches!(err, CoreError::Recovery { .. }));
    }
}
