//! Transaction lifecycle, durability failures and collection management.

use xmldb_core::{Config, CoreError, TransactionState, ADMIN_USER};
use xmldb_testkit::prelude::*;

#[test]
fn failed_commit_aborts_and_leaves_no_trace() {
    init_tracing();
    let harness = CrashHarness::new();
    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    store_document(&broker, "/db/t", "kept.xml", "<kept/>");

    let mut txn = broker.begin_transaction().unwrap();
    let collection = broker.get_or_create_collection(&mut txn, "/db/t").unwrap();
    let info = collection
        .validate_resource(&txn, &broker, "lost.xml", "<lost/>")
        .unwrap();
    collection.store(&mut txn, &broker, info, "<lost/>", false).unwrap();

    harness.storage().faults().fail_flushes(true);
    let err = broker.commit(&mut txn).unwrap_err();
    assert!(matches!(err, CoreError::JournalWrite { .. }), "{err:?}");
    assert_eq!(txn.state(), TransactionState::Aborted);
    assert!(broker.current_transaction().is_none());
    harness.storage().faults().reset();

    assert_eq!(broker.list_documents(None, "/db/t").unwrap(), ["kept.xml"]);
    assert!(matches!(broker.commit(&mut txn), Err(CoreError::TransactionAborted { .. })));

    store_document(&broker, "/db/t", "after.xml", "<after/>");
    drop(broker);
    harness.crash(pool);

    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(
        broker.list_documents(None, "/db/t").unwrap(),
        ["after.xml", "kept.xml"]
    );
}

#[test]
fn abort_is_idempotent_and_discards_writes() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let mut txn = broker.begin_transaction().unwrap();
        broker.get_or_create_collection(&mut txn, "/db/gone").unwrap();
        assert_eq!(txn.operation_count(), 1);

        broker.abort(&mut txn).unwrap();
        broker.abort(&mut txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);
        assert!(broker.get_collection(None, "/db/gone").unwrap().is_none());

        let mut committed = broker.begin_transaction().unwrap();
        broker.commit(&mut committed).unwrap();
        assert!(matches!(
            broker.abort(&mut committed),
            Err(CoreError::InvalidOperation { .. })
        ));
    });
}

#[test]
fn dropping_an_active_transaction_aborts_it() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        {
            let mut txn = broker.begin_transaction().unwrap();
            broker.get_or_create_collection(&mut txn, "/db/dropped").unwrap();
        }
        assert!(broker.current_transaction().is_none());
        assert!(broker.get_collection(None, "/db/dropped").unwrap().is_none());
        assert!(broker.begin_transaction().is_ok());
    });
}

#[test]
fn one_active_transaction_per_broker() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let mut first = broker.begin_transaction().unwrap();
        let err = broker.begin_transaction().unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err:?}");

        let other = pool.admin();
        let mut second = other.begin_transaction().unwrap();
        other.commit(&mut second).unwrap();
        broker.commit(&mut first).unwrap();
    });
}

#[test]
fn store_rules_for_existing_names_and_checksums() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        store_document(&broker, "/db/s", "a.xml", "<v>1</v>");

        let mut txn = broker.begin_transaction().unwrap();
        let collection = broker.get_or_create_collection(&mut txn, "/db/s").unwrap();

        let info = collection.validate_resource(&txn, &broker, "a.xml", "<v>2</v>").unwrap();
        let err = collection
            .store(&mut txn, &broker, info, "<v>2</v>", false)
            .unwrap_err();
        assert!(matches!(err, CoreError::DocumentExists { .. }), "{err:?}");

        let info = collection.validate_resource(&txn, &broker, "a.xml", "<v>2</v>").unwrap();
        let err = collection
            .store(&mut txn, &broker, info, "<v>3</v>", true)
            .unwrap_err();
        assert!(matches!(err, CoreError::ChecksumMismatch { .. }), "{err:?}");

        let info = collection.validate_resource(&txn, &broker, "a.xml", "<v>2</v>").unwrap();
        let stored = collection.store(&mut txn, &broker, info, "<v>2</v>", true).unwrap();
        assert_eq!(stored.name, "a.xml");
        broker.commit(&mut txn).unwrap();

        assert_eq!(query_strings(&broker, "doc('/db/s/a.xml')/v/string()"), ["2"]);
    });
}

#[test]
fn malformed_documents_are_rejected_before_journaling() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let mut txn = broker.begin_transaction().unwrap();
        let collection = broker.get_or_create_collection(&mut txn, "/db/bad").unwrap();
        let before = txn.operation_count();

        let err = collection
            .validate_resource(&txn, &broker, "a.xml", "<a><b></a>")
            .unwrap_err();
        assert!(matches!(err, CoreError::XmlParse { .. }), "{err:?}");
        let err = collection
            .validate_resource(&txn, &broker, "a.xml", r#"<a x="1" x="2"/>"#)
            .unwrap_err();
        assert!(matches!(err, CoreError::NameCollision { .. }), "{err:?}");
        let err = collection
            .validate_resource(&txn, &broker, "../a.xml", "<a/>")
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err:?}");

        assert_eq!(txn.operation_count(), before);
        assert!(txn.is_active());
    });
}

#[test]
fn collections_nest_and_remove_recursively() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        store_document(&broker, "/db/shop/books", "a.xml", "<book>A</book>");
        store_document(&broker, "/db/shop/books/old", "b.xml", "<book>B</book>");
        store_document(&broker, "/db/shop", "c.xml", "<book>C</book>");

        assert_eq!(
            query_strings(&broker, "collection('/db/shop')//book/string()"),
            ["A", "B", "C"]
        );

        let mut txn = broker.begin_transaction().unwrap();
        let shop = broker.get_collection(Some(&txn), "/db/shop").unwrap().unwrap();
        assert_eq!(shop.child_collections(&txn), ["/db/shop/books"]);
        assert_eq!(shop.document_names(&txn), ["c.xml"]);
        broker.remove_collection(&mut txn, "/db/shop/books").unwrap();
        broker.commit(&mut txn).unwrap();

        assert_eq!(query_strings(&broker, "collection('/db/shop')//book/string()"), ["C"]);
        assert!(broker.get_document(None, "/db/shop/books/old/b.xml").unwrap().is_none());

        let mut txn = broker.begin_transaction().unwrap();
        let err = broker.remove_collection(&mut txn, "/db").unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err:?}");
    });
}

#[test]
fn checkpoint_and_flush_keep_committed_state() {
    let harness = CrashHarness::new();
    let pool = harness.start_with(harness.config().sync_on_commit(false));
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    store_document(&broker, "/db/cp", "a.xml", "<a/>");
    broker.flush_to_log(true).unwrap();
    pool.checkpoint().unwrap();
    assert_eq!(pool.stats().checkpoints(), 1);

    store_document(&broker, "/db/cp", "b.xml", "<b/>");
    broker.flush_to_log(true).unwrap();
    drop(broker);
    harness.crash(pool);

    let pool = harness.start();
    let report = pool.recovery_report().expect("recovery ran");
    assert_eq!(report.replayed, 1);
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(broker.list_documents(None, "/db/cp").unwrap(), ["a.xml", "b.xml"]);
}

#[test]
fn checkpoint_refuses_while_transactions_are_active() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let _txn = broker.begin_transaction().unwrap();
        let err = pool.checkpoint().unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err:?}");
    });
}

#[test]
fn whitespace_only_text_is_dropped_unless_preserved() {
    for (preserve, expected) in [(false, 2), (true, 5)] {
        let pool = TestPool::with_config(
            Config::new()
                .memory(xmldb_core::MemoryStorage::new())
                .preserve_whitespace(preserve),
        );
        let broker = pool.admin();
        store_document(&broker, "/db/ws", "a.xml", "<a>\n  <b>x</b>\n  <c>y</c>\n</a>");
        assert_eq!(query_count(&broker, "count(doc('/db/ws/a.xml')//text())"), expected);
    }
}
