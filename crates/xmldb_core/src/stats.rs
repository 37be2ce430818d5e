//! Pool statistics.
//!
//! Counters are shared by every broker of a pool and can be read while
//! work is in progress.
//!
//! ```rust
//! use xmldb_core::{BrokerPool, Config};
//!
//! let pool = BrokerPool::configure(1, 2, Config::default()).unwrap();
//! let broker = pool.authenticate("guest", "guest").unwrap();
//! drop(broker);
//! assert_eq!(pool.stats().snapshot().brokers_acquired, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters of a broker pool. Values only increase.
#[derive(Debug, Default)]
pub struct PoolStats {
    // Brokers
    brokers_acquired: AtomicU64,
    /// Acquisitions that had to wait for a release.
    acquisition_waits: AtomicU64,

    // Transactions
    transactions_started: AtomicU64,
    transactions_committed: AtomicU64,
    transactions_aborted: AtomicU64,

    // Queries
    queries_compiled: AtomicU64,
    queries_executed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_evictions: AtomicU64,

    // Durability
    recoveries: AtomicU64,
    checkpoints: AtomicU64,
}

impl PoolStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_acquire(&self, waited: bool) {
        self.brokers_acquired.fetch_add(1, Ordering::Relaxed);
        if waited {
            self.acquisition_waits.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_transaction_start(&self) {
        self.transactions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_commit(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transaction_abort(&self) {
        self.transactions_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compile(&self) {
        self.queries_compiled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_execute(&self) {
        self.queries_executed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_cache_eviction(&self) {
        self.cache_evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovery(&self) {
        self.recoveries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of successful broker acquisitions.
    pub fn brokers_acquired(&self) -> u64 {
        self.brokers_acquired.load(Ordering::Relaxed)
    }

    /// Returns how many acquisitions blocked before succeeding.
    pub fn acquisition_waits(&self) -> u64 {
        self.acquisition_waits.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions started.
    pub fn transactions_started(&self) -> u64 {
        self.transactions_started.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions committed.
    pub fn transactions_committed(&self) -> u64 {
        self.transactions_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of transactions aborted.
    pub fn transactions_aborted(&self) -> u64 {
        self.transactions_aborted.load(Ordering::Relaxed)
    }

    /// Returns the number of queries compiled, cache misses included.
    pub fn queries_compiled(&self) -> u64 {
        self.queries_compiled.load(Ordering::Relaxed)
    }

    /// Returns the number of query executions.
    pub fn queries_executed(&self) -> u64 {
        self.queries_executed.load(Ordering::Relaxed)
    }

    /// Returns the number of compiled query cache hits.
    pub fn cache_hits(&self) -> u64 {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Returns the number of compiled query cache misses.
    pub fn cache_misses(&self) -> u64 {
        self.cache_misses.load(Ordering::Relaxed)
    }

    /// Returns the number of plans evicted from the cache.
    pub fn cache_evictions(&self) -> u64 {
        self.cache_evictions.load(Ordering::Relaxed)
    }

    /// Returns the number of recoveries run at start-up.
    pub fn recoveries(&self) -> u64 {
        self.recoveries.load(Ordering::Relaxed)
    }

    /// Returns the number of checkpoints taken.
    pub fn checkpoints(&self) -> u64 {
        self.checkpoints.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            brokers_acquired: self.brokers_acquired(),
            acquisition_waits: self.acquisition_waits(),
            transactions_started: self.transactions_started(),
            transactions_committed: self.transactions_committed(),
            transactions_aborted: self.transactions_aborted(),
            queries_compiled: self.queries_compiled(),
            queries_executed: self.queries_executed(),
            cache_hits: self.cache_hits(),
            cache_misses: self.cache_misses(),
            cache_evictions: self.cache_evictions(),
            recoveries: self.recoveries(),
            checkpoints: self.checkpoints(),
        }
    }
}

/// A point-in-time copy of [`PoolStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Successful broker acquisitions.
    pub brokers_acquired: u64,
    /// Acquisitions that waited for a release.
    pub acquisition_waits: u64,
    /// Transactions started.
    pub transactions_started: u64,
    /// Transactions committed.
    pub transactions_committed: u64,
    /// Transactions aborted.
    pub transactions_aborted: u64,
    /// Queries compiled.
    pub queries_compiled: u64,
    /// Query executions.
    pub queries_executed: u64,
    /// Compiled query cache hits.
    pub cache_hits: u64,
    /// Compiled query cache misses.
    pub cache_misses: u64,
    /// Plans evicted from the cache.
    pub cache_evictions: u64,
    /// Recoveries run.
    pub recoveries: u64,
    /// Checkpoints taken.
    pub checkpoints: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        let stats = PoolStats::new();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_acquisitions() {
        let stats = PoolStats::new();
        stats.record_acquire(false);
        stats.record_acquire(true);
        assert_eq!(stats.brokers_acquired(), 2);
        assert_eq!(stats.acquisition_waits(), 1);
    }

    #[test]
    fn record_transactions() {
        let stats = PoolStats::new();

        stats.record_transaction_start();
        stats.record_transaction_start();
        stats.record_transaction_commit();
        stats.record_transaction_abort();

        let snap = stats.snapshot();
        assert_eq!(snap.transactions_started, 2);
        assert_eq!(snap.transactions_committed, 1);
        assert_eq!(snap.transactions_aborted, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(PoolStats::new());
        let mut handles = vec![];

        for _ in 0..8 {
            let s = Arc::clone(&stats);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    s.record_cache_hit();
                    s.record_cache_miss();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.cache_hits(), 800);
        assert_eq!(stats.cache_misses(), 800);
    }
}
