//! Crash recovery testing for xmldb.
//!
//! A pool over a [`MemoryStorage`] can be "crashed" two ways: by dropping
//! it without shutdown, which leaves its journal behind, or by taking a
//! crash image with [`MemoryStorage::fork`] while work is in flight. A new
//! pool configured on the same location (or the image) then runs recovery.
//!
//! ## Test Strategy
//!
//! 1. **Crash before commit** - uncommitted documents are discarded
//! 2. **Crash after commit** - committed documents survive
//! 3. **Forced corruption** - a shutdown that skips its checkpoint recovers
//! 4. **Torn journal write** - a commit torn mid-append is dropped
//!
//! ## Usage
//!
//! ```rust
//! use xmldb_testkit::crash::{CrashHarness, CrashPoint};
//!
//! let result = CrashHarness::new().run_scenario(CrashPoint::BeforeCommit);
//! assert!(result.passed, "{result:?}");
//! ```

use crate::fixtures::{store_document, MAX_BROKERS, MIN_BROKERS, SAMPLE_XML};
use tracing::{debug, info};
use xmldb_core::{BrokerPool, Config, MemoryStorage, RecoveryReport, ADMIN_USER};

/// Collection the scenarios write to.
pub const CRASH_COLLECTION: &str = "/db/crash";

/// Points at which a crash can be simulated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Crash while a transaction has journaled work but not committed.
    BeforeCommit,
    /// Crash right after a commit was acknowledged.
    AfterCommit,
    /// Shut down with `force_corruption`, skipping the checkpoint.
    ForcedCorruption,
    /// Crash after a commit record was torn mid-append.
    TornJournalWrite,
}

impl CrashPoint {
    /// Every crash point.
    pub const ALL: [Self; 4] = [
        Self::BeforeCommit,
        Self::AfterCommit,
        Self::ForcedCorruption,
        Self::TornJournalWrite,
    ];
}

/// Result of a crash recovery scenario.
#[derive(Debug, Clone)]
pub struct CrashRecoveryResult {
    /// Where the crash was simulated.
    pub point: CrashPoint,
    /// Whether the recovered store matched the expectation.
    pub passed: bool,
    /// Documents expected in the crash collection after recovery.
    pub expected: Vec<String>,
    /// Documents found in the crash collection after recovery.
    pub actual: Vec<String>,
    /// What recovery reported.
    pub report: Option<RecoveryReport>,
    /// Any error message.
    pub error: Option<String>,
}

/// Configures, crashes and restarts pools over one in-memory location.
#[derive(Debug, Clone, Default)]
pub struct CrashHarness {
    storage: MemoryStorage,
}

impl CrashHarness {
    /// Creates a harness over a fresh location.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a harness over an existing location.
    pub fn with_storage(storage: MemoryStorage) -> Self {
        Self { storage }
    }

    /// Returns the location.
    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Returns a configuration over the location.
    pub fn config(&self) -> Config {
        Config::new().memory(self.storage.clone())
    }

    /// Configures a pool over the location; recovery runs if needed.
    pub fn start(&self) -> BrokerPool {
        self.start_with(self.config())
    }

    /// Configures a pool from `config`, which must use this location.
    pub fn start_with(&self, config: Config) -> BrokerPool {
        BrokerPool::configure(MIN_BROKERS, MAX_BROKERS, config).expect("Failed to configure pool")
    }

    /// Drops a pool without shutting it down.
    ///
    /// Every broker of the pool must already be dropped.
    pub fn crash(&self, pool: BrokerPool) {
        assert_eq!(pool.active(), 0, "brokers still held at crash");
        drop(pool);
        assert!(!self.storage.is_claimed(), "location still claimed after crash");
        debug!("pool dropped without shutdown");
    }

    /// Returns a harness over an independent copy of the location as it is
    /// right now, as if the process died at this instant.
    pub fn crash_image(&self) -> Self {
        Self::with_storage(self.storage.fork())
    }

    /// Returns the document names in `collection` as seen by a new admin
    /// broker.
    pub fn documents(pool: &BrokerPool, collection: &str) -> Vec<String> {
        let broker = pool
            .authenticate(ADMIN_USER, "")
            .expect("Failed to authenticate admin");
        let mut names = broker
            .list_documents(None, collection)
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Runs one crash scenario end to end.
    pub fn run_scenario(&self, point: CrashPoint) -> CrashRecoveryResult {
        info!(?point, "running crash scenario");
        let expected = vec!["committed.xml".to_string()];
        let recovered = match point {
            CrashPoint::BeforeCommit => self.crash_before_commit(),
            CrashPoint::AfterCommit => self.crash_after_commit(),
            CrashPoint::ForcedCorruption => self.forced_corruption(),
            CrashPoint::TornJournalWrite => self.torn_journal_write(),
        };

        let report = recovered.recovery_report();
        let actual = Self::documents(&recovered, CRASH_COLLECTION);
        let error = if report.is_none() {
            Some("recovery did not run".to_string())
        } else if actual != expected {
            Some("recovered documents differ".to_string())
        } else {
            None
        };
        let _ = recovered.shutdown(false);

        CrashRecoveryResult {
            point,
            passed: error.is_none(),
            expected,
            actual,
            report,
            error,
        }
    }

    fn commit_baseline(&self, pool: &BrokerPool) {
        let broker = pool
            .authenticate(ADMIN_USER, "")
            .expect("Failed to authenticate admin");
        store_document(&broker, CRASH_COLLECTION, "committed.xml", SAMPLE_XML);
    }

    fn crash_before_commit(&self) -> BrokerPool {
        let pool = self.start();
        self.commit_baseline(&pool);

        let broker = pool
            .authenticate(ADMIN_USER, "")
            .expect("Failed to authenticate admin");
        let mut txn = broker.begin_transaction().expect("Failed to begin");
        let collection = broker
            .get_or_create_collection(&mut txn, CRASH_COLLECTION)
            .expect("Failed to open collection");
        let xml = "<pending/>";
        let info = collection
            .validate_resource(&txn, &broker, "pending.xml", xml)
            .expect("Failed to validate");
        collection
            .store(&mut txn, &broker, info, xml, false)
            .expect("Failed to store");
        broker.flush_to_log(true).expect("Failed to flush");

        let image = self.crash_image();
        broker.abort(&mut txn).expect("Failed to abort");
        drop(broker);
        pool.shutdown(false).expect("Failed to shut down");
        image.start()
    }

    fn crash_after_commit(&self) -> BrokerPool {
        let pool = self.start();
        self.commit_baseline(&pool);
        self.crash(pool);
        self.start()
    }

    fn forced_corruption(&self) -> BrokerPool {
        let pool = self.start_with(self.config().force_corruption(true));
        self.commit_baseline(&pool);
        pool.shutdown(false).expect("Failed to shut down");
        self.start()
    }

    fn torn_journal_write(&self) -> BrokerPool {
        let pool = self.start();
        self.commit_baseline(&pool);

        let broker = pool
            .authenticate(ADMIN_USER, "")
            .expect("Failed to authenticate admin");
        let mut txn = broker.begin_transaction().expect("Failed to begin");
        let collection = broker
            .get_or_create_collection(&mut txn, CRASH_COLLECTION)
            .expect("Failed to open collection");
        let xml = "<torn/>";
        let info = collection
            .validate_resource(&txn, &broker, "torn.xml", xml)
            .expect("Failed to validate");
        collection
            .store(&mut txn, &broker, info, xml, false)
            .expect("Failed to store");

        self.storage.faults().tear_after(5);
        assert!(broker.commit(&mut txn).is_err(), "torn commit acknowledged");
        drop(txn);
        drop(broker);
        self.crash(pool);

        self.storage.faults().reset();
        self.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crash_before_commit() {
        let result = CrashHarness::new().run_scenario(CrashPoint::BeforeCommit);
        assert!(result.passed, "{result:?}");
        assert!(result.report.unwrap().discarded >= 1);
    }

    #[test]
    fn test_crash_after_commit() {
        let result = CrashHarness::new().run_scenario(CrashPoint::AfterCommit);
        assert!(result.passed, "{result:?}");
        assert!(result.report.unwrap().replayed >= 1);
    }

    #[test]
    fn test_all_crash_points_recover() {
        for point in CrashPoint::ALL {
            let result = CrashHarness::new().run_scenario(point);
            assert!(result.passed, "{result:?}");
        }
    }

    #[test]
    fn test_clean_shutdown_skips_recovery() {
        let harness = CrashHarness::new();
        let pool = harness.start();
        harness.commit_baseline(&pool);
        pool.shutdown(false).unwrap();

        let pool = harness.start();
        assert!(pool.recovery_report().is_none());
        assert_eq!(
            CrashHarness::documents(&pool, CRASH_COLLECTION),
            ["committed.xml"]
        );
    }
}
