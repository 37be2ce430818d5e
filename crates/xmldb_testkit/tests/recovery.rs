//! Crash recovery across pool restarts.

use xmldb_core::{CoreError, PoolStatus, ADMIN_USER};
use xmldb_testkit::prelude::*;

#[test]
fn every_crash_point_recovers_committed_work_only() {
    init_tracing();
    for point in CrashPoint::ALL {
        let result = CrashHarness::new().run_scenario(point);
        assert!(result.passed, "{result:?}");
    }
}

#[test]
fn forced_corruption_keeps_committed_and_drops_uncommitted() {
    let harness = CrashHarness::new();
    let pool = harness.start_with(harness.config().force_corruption(true));
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    store_document(&broker, "/db/r", "kept.xml", "<kept><v>1</v><v>2</v></kept>");

    let mut txn = broker.begin_transaction().unwrap();
    let collection = broker.get_or_create_collection(&mut txn, "/db/r").unwrap();
    let info = collection
        .validate_resource(&txn, &broker, "lost.xml", "<lost/>")
        .unwrap();
    collection.store(&mut txn, &broker, info, "<lost/>", false).unwrap();
    broker.flush_to_log(true).unwrap();

    let image = harness.crash_image();
    drop(txn);
    drop(broker);
    pool.shutdown(true).unwrap();

    let recovered = image.start();
    let report = recovered.recovery_report().expect("recovery ran");
    assert_eq!(report.replayed, 1);
    assert_eq!(report.discarded, 1);

    let broker = recovered.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(query_strings(&broker, "doc('/db/r/kept.xml')//v/string()"), ["1", "2"]);
    let err = broker.query_service().query("doc('/db/r/lost.xml')").unwrap_err();
    assert_eq!(err.query_code(), Some("FODC0002"));
    assert_eq!(broker.list_documents(None, "/db/r").unwrap(), ["kept.xml"]);
}

#[test]
fn two_recoveries_of_one_crash_converge() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    {
        let broker = pool.authenticate(ADMIN_USER, "").unwrap();
        for i in 0..5 {
            store_document(&broker, "/db/c", &format!("d{i}.xml"), &format!("<d n=\"{i}\"/>"));
        }
        let mut txn = broker.begin_transaction().unwrap();
        broker.remove_document(&mut txn, "/db/c/d1.xml").unwrap();
        broker.commit(&mut txn).unwrap();
    }
    harness.crash(pool);

    let first = harness.crash_image();
    let second = harness.crash_image();
    let dump = |h: &CrashHarness| {
        let pool = h.start();
        let report = pool.recovery_report().expect("recovery ran");
        let broker = pool.authenticate(ADMIN_USER, "").unwrap();
        let xml = query_xml(&broker, "for $d in collection('/db/c')/d order by $d/@n return $d");
        drop(broker);
        pool.shutdown(false).unwrap();
        (report, xml)
    };

    let (first_report, first_xml) = dump(&first);
    let (second_report, second_xml) = dump(&second);
    assert_eq!(first_report, second_report);
    assert_eq!(first_xml, second_xml);
    assert_eq!(first_xml, r#"<d n="0"/><d n="2"/><d n="3"/><d n="4"/>"#);
}

#[test]
fn recovered_store_accepts_new_work() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    store_document(&pool.authenticate(ADMIN_USER, "").unwrap(), "/db/n", "a.xml", "<a/>");
    harness.crash(pool);

    let pool = harness.start();
    assert_eq!(pool.status(), PoolStatus::Operational);
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    store_document(&broker, "/db/n", "b.xml", "<b/>");
    drop(broker);
    pool.shutdown(false).unwrap();

    let pool = harness.start();
    assert!(pool.recovery_report().is_none());
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(broker.list_documents(None, "/db/n").unwrap(), ["a.xml", "b.xml"]);
}

#[test]
fn corrupt_journal_fails_start_up() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    store_document(&pool.authenticate(ADMIN_USER, "").unwrap(), "/db/x", "a.xml", "<a/>");
    harness.crash(pool);

    harness.storage().journal().corrupt_byte(20).unwrap();
    let err = xmldb_core::BrokerPool::configure(1, 2, harness.config()).unwrap_err();
    assert!(matches!(err, CoreError::Recovery { .. }), "{err:?}");
    assert!(!harness.storage().is_claimed());
}

#[test]
fn file_pool_survives_restart() {
    let temp_dir = tempfile::TempDir::new().unwrap();
    let config = || xmldb_core::Config::new().directory(temp_dir.path().join("db"));

    let pool = xmldb_core::BrokerPool::configure(1, 2, config()).unwrap();
    store_document(&pool.authenticate(ADMIN_USER, "").unwrap(), "/db/f", "a.xml", SAMPLE_XML);
    drop(pool);

    let pool = xmldb_core::BrokerPool::configure(1, 2, config()).unwrap();
    assert!(pool.recovery_report().is_some());
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(query_count(&broker, "count(doc('/db/f/a.xml')//@*)"), 4);
    drop(broker);
    pool.shutdown(false).unwrap();

    let pool = xmldb_core::BrokerPool::configure(1, 2, config()).unwrap();
    assert!(pool.recovery_report().is_none());
}
