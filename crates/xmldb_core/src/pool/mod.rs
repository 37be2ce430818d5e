//! Broker pool.
//!
//! A pool owns one open store and hands out a bounded number of
//! [`Broker`]s. Acquisition blocks while all brokers are in use, up to the
//! configured wait. A pool is an ordinary value: several pools on different
//! locations can coexist, but a location accepts one pool at a time.
//!
//! ```rust
//! use xmldb_core::{BrokerPool, Config};
//!
//! let pool = BrokerPool::configure(1, 4, Config::default().admin_password("pw")).unwrap();
//! let broker = pool.authenticate("admin", "pw").unwrap();
//! let mut txn = broker.begin_transaction().unwrap();
//! let collection = broker.get_or_create_collection(&mut txn, "/db/books").unwrap();
//! let xml = "<book><title>Dune</title></book>";
//! let info = collection.validate_resource(&txn, &broker, "dune.xml", xml).unwrap();
//! collection.store(&mut txn, &broker, info, xml, false).unwrap();
//! broker.commit(&mut txn).unwrap();
//!
//! let titles = broker
//!     .query_service()
//!     .query("collection('/db/books')//title/string()")
//!     .unwrap();
//! assert_eq!(titles.len(), 1);
//! drop(broker);
//! pool.shutdown(false).unwrap();
//! ```

mod broker;
mod security;

pub use broker::Broker;
pub use security::{Account, SecurityManager, Subject, ADMIN_USER, DBA_GROUP, GUEST_USER};

use crate::config::Config;
use crate::database::Database;
use crate::error::{CoreError, CoreResult};
use crate::query::{HostBinding, NativeFunction, QueryPool};
use crate::stats::PoolStats;
use crate::transaction::RecoveryReport;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Lifecycle of a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolStatus {
    /// Opening the store.
    Initializing,
    /// Replaying the journal after an unclean shutdown.
    Recovering,
    /// Accepting acquisitions.
    Operational,
    /// Refusing acquisitions, waiting for in-flight work.
    ShuttingDown,
    /// Closed; the location is released.
    Shutdown,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Recovering => "recovering",
            Self::Operational => "operational",
            Self::ShuttingDown => "shutting down",
            Self::Shutdown => "shut down",
        };
        f.write_str(name)
    }
}

struct Slots {
    status: PoolStatus,
    /// Slot numbers ready for reuse.
    free: Vec<u32>,
    /// Slots created so far.
    total: usize,
    /// Slots handed out.
    active: usize,
}

pub(crate) struct PoolInner {
    min: usize,
    max: usize,
    database: Database,
    security: SecurityManager,
    queries: QueryPool,
    stats: Arc<PoolStats>,
    slots: Mutex<Slots>,
    released: Condvar,
}

impl PoolInner {
    pub(crate) fn status(&self) -> PoolStatus {
        self.slots.lock().status
    }

    pub(crate) fn queries(&self) -> &QueryPool {
        &self.queries
    }

    pub(crate) fn config(&self) -> &Config {
        self.database.config()
    }

    fn release_slot(&self, id: u32) {
        let mut slots = self.slots.lock();
        slots.active = slots.active.saturating_sub(1);
        slots.free.push(id);
        drop(slots);
        self.released.notify_all();
        trace!(broker = id, "broker released");
    }
}

/// A bounded pool of brokers over one store.
///
/// Cloning gives another handle to the same pool.
#[derive(Clone)]
pub struct BrokerPool {
    inner: Arc<PoolInner>,
}

impl BrokerPool {
    /// Opens the store in `config` and creates a pool of `min..=max` brokers.
    ///
    /// Recovery, when needed, finishes before this returns, so no broker is
    /// handed out before the store is consistent.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` unless `1 <= min <= max`
    /// - `DatabaseLocked` if another pool holds the location
    /// - `Recovery` if the journal cannot be replayed
    pub fn configure(min: usize, max: usize, config: Config) -> CoreResult<Self> {
        if min == 0 || min > max {
            return Err(CoreError::invalid_operation(format!(
                "invalid pool bounds: min {min}, max {max}"
            )));
        }
        info!(min, max, status = %PoolStatus::Initializing, "configuring broker pool");

        let stats = Arc::new(PoolStats::new());
        let security = SecurityManager::new(&config.admin_password);
        let queries = QueryPool::new(config.query_cache_capacity, Arc::clone(&stats));
        let database = Database::open(config, Arc::clone(&stats), || {
            info!(status = %PoolStatus::Recovering, "broker pool recovering");
        })?;

        let inner = Arc::new(PoolInner {
            min,
            max,
            database,
            security,
            queries,
            stats,
            slots: Mutex::new(Slots {
                status: PoolStatus::Operational,
                free: (0..min as u32).rev().collect(),
                total: min,
                active: 0,
            }),
            released: Condvar::new(),
        });
        info!(status = %PoolStatus::Operational, "broker pool ready");
        Ok(Self { inner })
    }

    /// Acquires a broker for `subject`, waiting while all are in use.
    ///
    /// # Errors
    ///
    /// - `Authentication` if the subject's account is unknown or deactivated
    /// - `PoolClosed` if the pool is shut down, also while waiting
    /// - `PoolExhausted` if no broker was released within `acquire_timeout`
    pub fn acquire(&self, subject: &Subject) -> CoreResult<Broker> {
        let inner = &self.inner;
        inner.security.validate(subject)?;

        let start = Instant::now();
        let deadline = start + inner.config().acquire_timeout;
        let mut waited = false;
        let mut slots = inner.slots.lock();
        let id = loop {
            if slots.status != PoolStatus::Operational {
                return Err(CoreError::PoolClosed);
            }
            if let Some(id) = slots.free.pop() {
                break id;
            }
            if slots.total < inner.max {
                slots.total += 1;
                break (slots.total - 1) as u32;
            }

            waited = true;
            trace!(user = subject.name(), "pool exhausted, waiting");
            let timed_out = inner.released.wait_until(&mut slots, deadline).timed_out();
            if timed_out
                && slots.status == PoolStatus::Operational
                && slots.free.is_empty()
                && slots.total >= inner.max
            {
                return Err(CoreError::PoolExhausted {
                    waited: start.elapsed(),
                });
            }
        };
        slots.active += 1;
        drop(slots);

        inner.stats.record_acquire(waited);
        debug!(broker = id, user = subject.name(), "broker acquired");
        Ok(Broker::new(Arc::clone(inner), id, subject.clone()))
    }

    /// Logs in and acquires a broker.
    ///
    /// # Errors
    ///
    /// As [`Self::acquire`], plus `Authentication` for a wrong password.
    pub fn authenticate(&self, user: &str, password: &str) -> CoreResult<Broker> {
        let subject = self.inner.security.authenticate(user, password)?;
        self.acquire(&subject)
    }

    /// Returns a broker to the pool. Same as dropping it.
    pub fn release(&self, broker: Broker) {
        drop(broker);
    }

    /// Shuts the pool down.
    ///
    /// New acquisitions and new transactions fail with `PoolClosed` at once.
    /// Unless `immediate`, waits up to `shutdown_timeout` for active
    /// transactions to commit or abort; brokers keep working on them.
    /// The store is checkpointed if nothing is left active and closed;
    /// anything still active is left for recovery.
    ///
    /// # Errors
    ///
    /// Returns the error of the final checkpoint or flush.
    pub fn shutdown(&self, immediate: bool) -> CoreResult<()> {
        let inner = &self.inner;
        {
            let mut slots = inner.slots.lock();
            if matches!(slots.status, PoolStatus::ShuttingDown | PoolStatus::Shutdown) {
                return Ok(());
            }
            slots.status = PoolStatus::ShuttingDown;
        }
        inner.released.notify_all();
        info!(immediate, active = self.active(), "broker pool shutting down");

        let manager = inner.database.manager();
        if !immediate && !manager.wait_idle(inner.config().shutdown_timeout) {
            warn!(
                active = manager.active_count(),
                "transactions still active at shutdown"
            );
        }
        let result = inner.database.close();
        inner.queries.clear();

        inner.slots.lock().status = PoolStatus::Shutdown;
        inner.released.notify_all();
        info!("broker pool shut down");
        result
    }

    /// Returns the pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Returns the number of brokers handed out.
    #[must_use]
    pub fn active(&self) -> usize {
        self.inner.slots.lock().active
    }

    /// Returns how many brokers can be acquired without waiting.
    #[must_use]
    pub fn available(&self) -> usize {
        let slots = self.inner.slots.lock();
        slots.free.len() + (self.inner.max - slots.total)
    }

    /// Returns the number of brokers created so far.
    #[must_use]
    pub fn total(&self) -> usize {
        self.inner.slots.lock().total
    }

    /// Returns the lower bound of brokers kept ready.
    #[must_use]
    pub fn min(&self) -> usize {
        self.inner.min
    }

    /// Returns the maximum number of brokers.
    #[must_use]
    pub fn max(&self) -> usize {
        self.inner.max
    }

    /// Returns the pool counters.
    #[must_use]
    pub fn stats(&self) -> &PoolStats {
        &self.inner.stats
    }

    /// Returns the account store.
    #[must_use]
    pub fn security(&self) -> &SecurityManager {
        &self.inner.security
    }

    /// Returns the compiled query cache.
    #[must_use]
    pub fn query_pool(&self) -> &QueryPool {
        &self.inner.queries
    }

    /// Returns what recovery did when the pool was configured, if it ran.
    #[must_use]
    pub fn recovery_report(&self) -> Option<RecoveryReport> {
        self.inner.database.recovery()
    }

    /// Takes a checkpoint.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` while transactions are active.
    pub fn checkpoint(&self) -> CoreResult<()> {
        if self.status() != PoolStatus::Operational {
            return Err(CoreError::PoolClosed);
        }
        self.inner.database.checkpoint()
    }

    /// Registers a library module, making it importable by its namespace.
    ///
    /// # Errors
    ///
    /// `QueryCompilation` if the source is not a library module.
    pub fn register_module(&self, source: &str) -> CoreResult<String> {
        self.inner.queries.register_module(source)
    }

    /// Binds a `host:` namespace to a host implementation.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the namespace does not use the `host:` scheme.
    pub fn register_host_binding(
        &self,
        namespace: &str,
        binding: Arc<dyn HostBinding>,
    ) -> CoreResult<()> {
        self.inner.queries.register_host_binding(namespace, binding)
    }

    /// Registers a native function callable from queries.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a reserved namespace.
    pub fn register_function(&self, function: NativeFunction) -> CoreResult<()> {
        self.inner.queries.register_function(function)
    }
}

impl fmt::Debug for BrokerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerPool")
            .field("status", &self.status())
            .field("active", &self.active())
            .field("max", &self.inner.max)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::thread;
    use std::time::Duration;

    fn pool(max: usize) -> BrokerPool {
        BrokerPool::configure(
            1,
            max,
            Config::new().acquire_timeout(Duration::from_millis(50)),
        )
        .unwrap()
    }

    #[test]
    fn bounds_are_validated() {
        assert!(BrokerPool::configure(0, 1, Config::new()).is_err());
        assert!(BrokerPool::configure(3, 2, Config::new()).is_err());
    }

    #[test]
    fn brokers_are_reused() {
        let pool = pool(2);
        let a = pool.authenticate("guest", "guest").unwrap();
        let id = a.id();
        pool.release(a);
        let b = pool.authenticate("guest", "guest").unwrap();
        assert_eq!(b.id(), id);
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn exhausted_pool_times_out() {
        let pool = pool(1);
        let _held = pool.authenticate("guest", "guest").unwrap();
        let err = pool.authenticate("guest", "guest").unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, CoreError::PoolExhausted { .. }));
    }

    #[test]
    fn waiter_is_woken_by_shutdown() {
        let pool = BrokerPool::configure(
            1,
            1,
            Config::new().acquire_timeout(Duration::from_secs(10)),
        )
        .unwrap();
        let held = pool.authenticate("guest", "guest").unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.authenticate("guest", "guest").map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.shutdown(true).unwrap();
        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(CoreError::PoolClosed)));
        assert!(matches!(held.begin_transaction(), Err(CoreError::PoolClosed)));
    }

    #[test]
    fn bad_identity_is_an_authentication_error() {
        let pool = pool(1);
        assert!(matches!(
            pool.authenticate("admin", "wrong"),
            Err(CoreError::Authentication { .. })
        ));

        pool.security().add_account("temp", "pw", &[]).unwrap();
        let subject = pool.security().authenticate("temp", "pw").unwrap();
        pool.security().set_active("temp", false).unwrap();
        assert!(matches!(
            pool.acquire(&subject),
            Err(CoreError::Authentication { .. })
        ));
    }

    #[test]
    fn one_pool_per_location() {
        let memory = MemoryStorage::new();
        let first = BrokerPool::configure(1, 1, Config::new().memory(memory.clone())).unwrap();
        assert!(matches!(
            BrokerPool::configure(1, 1, Config::new().memory(memory.clone())),
            Err(CoreError::DatabaseLocked)
        ));
        first.shutdown(false).unwrap();
        assert_eq!(first.status(), PoolStatus::Shutdown);
        BrokerPool::configure(1, 1, Config::new().memory(memory)).unwrap();
    }

    #[test]
    fn second_begin_on_one_broker_fails() {
        let pool = pool(1);
        let broker = pool.authenticate("guest", "guest").unwrap();
        let mut txn = broker.begin_transaction().unwrap();
        assert!(matches!(
            broker.begin_transaction(),
            Err(CoreError::InvalidOperation { .. })
        ));
        broker.commit(&mut txn).unwrap();
        broker.begin_transaction().unwrap();
    }
}
