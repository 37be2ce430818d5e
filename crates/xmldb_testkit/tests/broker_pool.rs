//! Broker acquisition, authentication and pool lifecycle.

use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use xmldb_core::{
    BrokerPool, Config, CoreError, MemoryStorage, PoolStatus, ADMIN_USER, GUEST_USER,
};
use xmldb_testkit::prelude::*;

fn pool(min: usize, max: usize, config: Config) -> BrokerPool {
    BrokerPool::configure(min, max, config.memory(MemoryStorage::new())).unwrap()
}

#[test]
fn acquire_blocks_until_a_broker_is_released() {
    init_tracing();
    let pool = pool(1, 1, Config::new());
    let held = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(pool.available(), 0);

    let (tx, rx) = mpsc::channel();
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || {
            let broker = pool.authenticate(GUEST_USER, GUEST_USER).unwrap();
            tx.send(broker.subject().name().to_string()).unwrap();
        })
    };

    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    pool.release(held);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), GUEST_USER);
    waiter.join().unwrap();

    assert_eq!(pool.active(), 0);
    assert!(pool.stats().acquisition_waits() >= 1);
    pool.shutdown(false).unwrap();
}

#[test]
fn acquire_times_out_when_no_broker_is_released() {
    let pool = pool(1, 1, Config::new().acquire_timeout(Duration::from_millis(20)));
    let _held = pool.authenticate(ADMIN_USER, "").unwrap();

    let err = pool.authenticate(ADMIN_USER, "").unwrap_err();
    assert!(matches!(err, CoreError::PoolExhausted { .. }), "{err:?}");
    assert!(err.is_pool_error());
    assert!(err.is_retryable());
}

#[test]
fn brokers_grow_up_to_max_and_are_reused() {
    let pool = pool(1, 3, Config::new());
    assert_eq!((pool.min(), pool.max(), pool.total()), (1, 3, 1));

    let brokers: Vec<_> = (0..3)
        .map(|_| pool.authenticate(ADMIN_USER, "").unwrap())
        .collect();
    assert_eq!((pool.active(), pool.total(), pool.available()), (3, 3, 0));

    drop(brokers);
    assert_eq!((pool.active(), pool.total(), pool.available()), (0, 3, 3));
    let _again = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(pool.total(), 3);
}

#[test]
fn authentication_failures_are_not_pool_errors() {
    let pool = pool(1, 2, Config::new().admin_password("secret"));

    for (user, password) in [(ADMIN_USER, ""), (ADMIN_USER, "wrong"), ("nobody", "secret")] {
        let err = pool.authenticate(user, password).unwrap_err();
        assert!(matches!(err, CoreError::Authentication { .. }), "{err:?}");
        assert!(!err.is_pool_error());
    }
    assert_eq!(pool.active(), 0);

    let broker = pool.authenticate(ADMIN_USER, "secret").unwrap();
    assert!(broker.subject().is_dba());
    let guest = pool.authenticate(GUEST_USER, GUEST_USER).unwrap();
    assert!(!guest.subject().is_dba());
}

#[test]
fn deactivated_accounts_cannot_acquire() {
    let pool = pool(1, 2, Config::new());
    pool.security().add_account("alice", "pw", &["users"]).unwrap();
    let subject = pool.security().authenticate("alice", "pw").unwrap();
    assert!(pool.acquire(&subject).is_ok());

    pool.security().set_active("alice", false).unwrap();
    let err = pool.acquire(&subject).unwrap_err();
    assert!(matches!(err, CoreError::Authentication { .. }), "{err:?}");
}

#[test]
fn shutdown_closes_the_pool() {
    let storage = MemoryStorage::new();
    let pool = BrokerPool::configure(1, 2, Config::new().memory(storage.clone())).unwrap();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert!(storage.is_claimed());

    pool.shutdown(true).unwrap();
    assert_eq!(pool.status(), PoolStatus::Shutdown);
    assert!(!storage.is_claimed());

    let err = pool.authenticate(ADMIN_USER, "").unwrap_err();
    assert!(matches!(err, CoreError::PoolClosed));
    assert!(err.is_pool_error());
    assert!(!err.is_retryable());
    assert!(matches!(broker.begin_transaction(), Err(CoreError::PoolClosed)));
    assert!(matches!(broker.query_service().query("1"), Err(CoreError::PoolClosed)));

    pool.shutdown(false).unwrap();
}

#[test]
fn shutdown_wakes_waiting_acquirers() {
    let pool = pool(1, 1, Config::new());
    let _held = pool.authenticate(ADMIN_USER, "").unwrap();

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.authenticate(ADMIN_USER, "").map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));
    pool.shutdown(true).unwrap();

    let result = waiter.join().unwrap();
    assert!(matches!(result, Err(CoreError::PoolClosed)), "{result:?}");
}

#[test]
fn graceful_shutdown_lets_begun_transactions_commit() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    let idle = pool.authenticate(ADMIN_USER, "").unwrap();

    let mut txn = broker.begin_transaction().unwrap();
    let collection = broker.get_or_create_collection(&mut txn, "/db/p").unwrap();
    let info = collection.validate_resource(&txn, &broker, "a.xml", "<a/>").unwrap();
    collection.store(&mut txn, &broker, info, "<a/>", false).unwrap();

    let closer = {
        let pool = pool.clone();
        thread::spawn(move || pool.shutdown(false))
    };
    while pool.status() == PoolStatus::Operational {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(matches!(idle.begin_transaction(), Err(CoreError::PoolClosed)));
    assert!(matches!(pool.authenticate(ADMIN_USER, ""), Err(CoreError::PoolClosed)));

    broker.commit(&mut txn).unwrap();
    closer.join().unwrap().unwrap();
    assert_eq!(pool.status(), PoolStatus::Shutdown);
    drop((broker, idle));

    let pool = harness.start();
    assert!(pool.recovery_report().is_none());
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert!(broker.get_document(None, "/db/p/a.xml").unwrap().is_some());
}

#[test]
fn immediate_shutdown_refuses_late_commits() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    let mut txn = broker.begin_transaction().unwrap();
    broker.get_or_create_collection(&mut txn, "/db/late").unwrap();

    pool.shutdown(true).unwrap();
    assert!(matches!(broker.commit(&mut txn), Err(CoreError::PoolClosed)));
    drop(txn);
    drop(broker);

    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert!(broker.get_collection(None, "/db/late").unwrap().is_none());
}

#[test]
fn one_location_accepts_one_pool() {
    let storage = MemoryStorage::new();
    let first = BrokerPool::configure(1, 2, Config::new().memory(storage.clone())).unwrap();

    let err = BrokerPool::configure(1, 2, Config::new().memory(storage.clone())).unwrap_err();
    assert!(matches!(err, CoreError::DatabaseLocked), "{err:?}");

    first.shutdown(false).unwrap();
    let second = BrokerPool::configure(1, 2, Config::new().memory(storage)).unwrap();
    assert_eq!(second.status(), PoolStatus::Operational);
}

#[test]
fn independent_pools_coexist() {
    let a = TestPool::memory();
    let b = TestPool::memory();
    store_document(&a.admin(), "/db/a", "doc.xml", "<only-in-a/>");

    assert_eq!(a.admin().list_documents(None, "/db/a").unwrap(), ["doc.xml"]);
    let err = b.admin().list_documents(None, "/db/a").unwrap_err();
    assert!(matches!(err, CoreError::CollectionNotFound { .. }), "{err:?}");
}

#[test]
fn invalid_bounds_are_rejected() {
    for (min, max) in [(0, 1), (3, 2)] {
        let err = BrokerPool::configure(min, max, Config::new()).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err:?}");
    }
}

#[test]
fn pool_counts_transactions() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        store_document(&broker, "/db/s", "a.xml", "<a/>");
        let mut txn = broker.begin_transaction().unwrap();
        broker.abort(&mut txn).unwrap();
        broker.abort(&mut txn).unwrap();

        let stats = pool.stats().snapshot();
        assert_eq!(stats.transactions_started, 2);
        assert_eq!(stats.transactions_committed, 1);
        assert_eq!(stats.transactions_aborted, 1);
    });
}
