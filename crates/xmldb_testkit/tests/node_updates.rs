//! Node-level updates and copies, journaled and recovered.

use xmldb_core::{
    CoreError, IndexDeclaration, InsertPosition, QName, ValueType, ADMIN_USER,
};
use xmldb_testkit::prelude::*;

const PRODUCTS: &str = concat!(
    r#"<products><product id="1"><description>Milk</description><price>2</price></product>"#,
    "</products>",
);

fn product_indexes() -> Vec<IndexDeclaration> {
    vec![
        IndexDeclaration::element(QName::local("price"), ValueType::Double),
        IndexDeclaration::attribute(QName::local("id"), ValueType::String),
    ]
}

#[test]
fn committed_node_updates_survive_a_crash() {
    init_tracing();
    let harness = CrashHarness::new();
    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    declare_indexes(&broker, "/db/test", &product_indexes());
    store_document(&broker, "/db/test", "products.xml", PRODUCTS);
    let doc = "doc('/db/test/products.xml')";

    let mut txn = broker.begin_transaction().unwrap();
    let products = node_address(&broker, Some(&txn), &format!("{doc}/products"));
    broker
        .insert_nodes(
            &mut txn,
            products,
            InsertPosition::Into,
            r#"<product id="2"><description>Bread</description><price>3</price></product>"#,
        )
        .unwrap();
    let first = node_address(&broker, Some(&txn), &format!("{doc}//product[@id = '1']"));
    broker
        .insert_nodes(
            &mut txn,
            first,
            InsertPosition::Before,
            r#"<product id="0"><description>Tea</description><price>4</price></product>"#,
        )
        .unwrap();
    let price = node_address(&broker, Some(&txn), &format!("{doc}//product[@id = '2']/price"));
    broker.update_value(&mut txn, price, "5").unwrap();
    let tea = node_address(&broker, Some(&txn), &format!("{doc}//product[@id = '0']/description"));
    broker.rename_node(&mut txn, tea, QName::local("name")).unwrap();
    let milk = node_address(&broker, Some(&txn), &format!("{doc}//product[@id = '1']"));
    broker.remove_node(&mut txn, milk).unwrap();
    let name = node_address(&broker, Some(&txn), &format!("{doc}//name"));
    broker
        .replace_node(&mut txn, name, "<title>Green tea</title>")
        .unwrap();
    assert_eq!(
        query_xml(&broker, &format!("{doc}/products")),
        PRODUCTS,
        "updates are invisible before commit"
    );
    broker.commit(&mut txn).unwrap();

    let mut pending = broker.begin_transaction().unwrap();
    let price = node_address(&broker, Some(&pending), &format!("{doc}//product[@id = '2']/price"));
    broker.update_value(&mut pending, price, "99").unwrap();
    broker.flush_to_log(true).unwrap();

    let image = harness.crash_image();
    drop(pending);
    drop(broker);
    pool.shutdown(true).unwrap();

    let recovered = image.start();
    let report = recovered.recovery_report().expect("recovery ran");
    assert_eq!(report.discarded, 1);

    let broker = recovered.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(
        query_xml(&broker, &format!("{doc}/products")),
        concat!(
            r#"<products><product id="0"><title>Green tea</title><price>4</price></product>"#,
            r#"<product id="2"><description>Bread</description><price>5</price></product>"#,
            "</products>",
        )
    );
    let ids = |filter: &str| {
        query_strings(&broker, &format!("collection('/db/test')//product[{filter}]/@id/string()"))
    };
    assert_eq!(ids("price = 5"), ["2"]);
    assert!(ids("price = 3").is_empty());
    assert!(ids("price = 99").is_empty());
    assert!(ids("@id = '1'").is_empty());
    assert_eq!(
        query_strings(&broker, "collection('/db/test')//product[@id = '0']/title/string()"),
        ["Green tea"]
    );
}

#[test]
fn refused_node_updates_leave_the_transaction_usable() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        store_document(&broker, "/db/n", "a.xml", r#"<a x="1" y="2"><b/></a>"#);
        let doc = "doc('/db/n/a.xml')";

        let mut txn = broker.begin_transaction().unwrap();
        let b = node_address(&broker, Some(&txn), &format!("{doc}/a/b"));
        broker.remove_node(&mut txn, b).unwrap();
        let err = broker.remove_node(&mut txn, b).unwrap_err();
        assert!(matches!(err, CoreError::NodeNotFound { .. }), "{err}");

        let y = node_address(&broker, Some(&txn), &format!("{doc}/a/@y"));
        let err = broker
            .rename_node(&mut txn, y, QName::local("x"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NameCollision { .. }), "{err}");
        let err = broker
            .insert_nodes(&mut txn, y, InsertPosition::After, "<c/>")
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err}");

        let root = node_address(&broker, Some(&txn), &format!("{doc}/a"));
        let err = broker.remove_node(&mut txn, root).unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err}");
        let document = node_address(&broker, Some(&txn), doc);
        let err = broker.update_value(&mut txn, document, "x").unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err}");

        assert!(txn.is_active());
        broker.commit(&mut txn).unwrap();
        assert_eq!(query_xml(&broker, &format!("{doc}/a")), r#"<a x="1" y="2"/>"#);
    });
}

#[test]
fn concurrent_updates_of_one_document_conflict() {
    with_memory_pool(|pool| {
        let first = pool.admin();
        let second = pool.admin();
        store_document(&first, "/db/c", "d.xml", "<d><v>1</v></d>");
        let v = node_address(&first, None, "doc('/db/c/d.xml')/d/v");

        let mut t1 = first.begin_transaction().unwrap();
        let mut t2 = second.begin_transaction().unwrap();
        first.update_value(&mut t1, v, "2").unwrap();
        second.update_value(&mut t2, v, "3").unwrap();
        first.commit(&mut t1).unwrap();

        let err = second.commit(&mut t2).unwrap_err();
        assert!(matches!(err, CoreError::NodeNotFound { .. }), "{err}");
        assert!(!t2.is_active());
        assert_eq!(query_strings(&first, "doc('/db/c/d.xml')/d/v/string()"), ["2"]);
    });
}

#[test]
fn copies_survive_a_crash_with_new_ids() {
    let harness = CrashHarness::new();
    let pool = harness.start();
    let broker = pool.authenticate(ADMIN_USER, "").unwrap();
    declare_indexes(&broker, "/db/src", &product_indexes());
    store_document(&broker, "/db/src", "a.xml", "<a><price>5</price></a>");
    store_document(&broker, "/db/src/sub", "b.xml", "<b/>");

    let mut txn = broker.begin_transaction().unwrap();
    let copy = broker
        .copy_resource(&mut txn, "/db/src/a.xml", "/db", Some("a-copy.xml"))
        .unwrap();
    assert_eq!(copy.path(), "/db/a-copy.xml");
    let copied = broker
        .copy_collection(&mut txn, "/db/src", "/db", Some("dst"))
        .unwrap();
    assert_eq!(copied.indexes(), product_indexes().as_slice());

    let err = broker
        .copy_collection(&mut txn, "/db/src", "/db", Some("dst"))
        .unwrap_err();
    assert!(matches!(err, CoreError::CollectionExists { .. }), "{err}");
    let err = broker
        .copy_collection(&mut txn, "/db/src", "/db/src/sub", None)
        .unwrap_err();
    assert!(matches!(err, CoreError::InvalidOperation { .. }), "{err}");
    let err = broker
        .copy_resource(&mut txn, "/db/src/a.xml", "/db", Some("a-copy.xml"))
        .unwrap_err();
    assert!(matches!(err, CoreError::DocumentExists { .. }), "{err}");
    broker.commit(&mut txn).unwrap();

    let mut pending = broker.begin_transaction().unwrap();
    broker
        .copy_resource(&mut pending, "/db/src/sub/b.xml", "/db", None)
        .unwrap();
    broker.flush_to_log(true).unwrap();

    let image = harness.crash_image();
    drop(pending);
    drop(broker);
    pool.shutdown(true).unwrap();

    let recovered = image.start();
    let broker = recovered.authenticate(ADMIN_USER, "").unwrap();
    assert_eq!(CrashHarness::documents(&recovered, "/db"), ["a-copy.xml"]);
    assert_eq!(CrashHarness::documents(&recovered, "/db/dst/sub"), ["b.xml"]);

    let original = broker.get_document(None, "/db/src/a.xml").unwrap().unwrap();
    let copy = broker.get_document(None, "/db/dst/a.xml").unwrap().unwrap();
    assert_ne!(original.id, copy.id);
    assert_eq!(query_count(&broker, "count(collection('/db')//a[price = 5])"), 3);
    let dst = broker.get_collection(None, "/db/dst").unwrap().unwrap();
    assert_eq!(dst.indexes(), product_indexes().as_slice());
}
