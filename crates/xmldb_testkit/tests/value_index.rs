//! Value index lookups agree with plain scans.

use proptest::prelude::*;
use xmldb_core::{Broker, CoreError, IndexDeclaration, QName, ValueType};
use xmldb_testkit::prelude::*;

const INDEXED: &str = "/db/indexed";
const SCANNED: &str = "/db/scanned";

fn declarations() -> Vec<IndexDeclaration> {
    vec![
        IndexDeclaration::element(QName::local("price"), ValueType::Double),
        IndexDeclaration::element(QName::local("title"), ValueType::String),
        IndexDeclaration::attribute(QName::local("id"), ValueType::String),
        IndexDeclaration::attribute(QName::local("qty"), ValueType::Double),
    ]
}

fn item(id: &str, title: &str, price: &str, qty: &str) -> String {
    format!(
        concat!(
            r#"<catalog><item id="{}" qty="{}"><title>{}</title>"#,
            r#"<price>{}</price></item></catalog>"#,
        ),
        id, qty, title, price
    )
}

fn load(broker: &Broker, documents: &[String]) {
    declare_indexes(broker, INDEXED, &declarations());
    for (i, xml) in documents.iter().enumerate() {
        let name = format!("d{i:03}.xml");
        store_document(broker, INDEXED, &name, xml);
        store_document(broker, SCANNED, &name, xml);
    }
}

fn both(broker: &Broker, path: &str) -> (String, String) {
    (
        query_xml(broker, &format!("collection('{INDEXED}'){path}")),
        query_xml(broker, &format!("collection('{SCANNED}'){path}")),
    )
}

fn sample() -> Vec<String> {
    vec![
        item("a1", "Dune", "10", "3"),
        item("a2", "Emma", "10.0", "1"),
        item("a3", "Dune", "12.5", "x"),
        item("a4", "Ulysses", "n/a", "3.0"),
    ]
}

#[test]
fn element_and_attribute_lookups_match_scans() {
    init_tracing();
    with_memory_pool(|pool| {
        let broker = pool.admin();
        load(&broker, &sample());

        for path in [
            "//price[. = 10]",
            "//price[. = 12.5]",
            "//title[. = 'Dune']",
            "//item[@id = 'a3']",
            "//item[@qty = 3]",
            "/catalog//title[. = 'Emma']",
            "//title[. = 'Missing']",
        ] {
            let (indexed, scanned) = both(&broker, path);
            assert_eq!(indexed, scanned, "{path}");
        }

        let (prices, _) = both(&broker, "//price[. = 10]");
        assert_eq!(prices, "<price>10</price><price>10.0</price>");
        let (items, _) = both(&broker, "//item[@qty = 3]/@id/string()");
        assert_eq!(items, "a1 a4");
    });
}

#[test]
fn mismatched_literal_types_fall_back_to_scanning() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        load(&broker, &sample());

        // A string literal against a numeric index compares as strings.
        let (indexed, scanned) = both(&broker, "//price[. = '10.0']");
        assert_eq!(indexed, scanned);
        assert_eq!(indexed, "<price>10.0</price>");
    });
}

#[test]
fn index_follows_commits_and_removals() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        load(&broker, &sample());

        let mut txn = broker.begin_transaction().unwrap();
        broker
            .remove_document(&mut txn, &format!("{INDEXED}/d000.xml"))
            .unwrap();
        let inside = broker
            .query_service()
            .query_in(&txn, &format!("count(collection('{INDEXED}')//price[. = 10])"))
            .unwrap();
        assert_eq!(inside[0].string_value(), "1");
        assert_eq!(
            query_count(&broker, &format!("count(collection('{INDEXED}')//price[. = 10])")),
            2
        );
        broker.commit(&mut txn).unwrap();
        assert_eq!(
            query_count(&broker, &format!("count(collection('{INDEXED}')//price[. = 10])")),
            1
        );

        store_document(&broker, INDEXED, "d001.xml", &item("a2", "Emma", "11", "1"));
        assert_eq!(
            query_count(&broker, &format!("count(collection('{INDEXED}')//price[. = 10])")),
            0
        );
    });
}

#[test]
fn indexes_declared_after_storing_cover_existing_documents() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        store_document(&broker, "/db/late", "a.xml", &item("a1", "Dune", "7", "1"));
        declare_indexes(&broker, "/db/late", &declarations());

        let mut txn = broker.begin_transaction().unwrap();
        let collection = broker.get_collection(Some(&txn), "/db/late").unwrap().unwrap();
        assert_eq!(collection.indexes().len(), 4);
        broker.abort(&mut txn).unwrap();

        assert_eq!(
            query_strings(&broker, "collection('/db/late')//item[@id = 'a1']/title/string()"),
            ["Dune"]
        );
    });
}

#[test]
fn value_comparison_of_incompatible_types_is_a_type_mismatch() {
    with_memory_pool(|pool| {
        let broker = pool.admin();
        let err = broker.query_service().query("'10' eq 10").unwrap_err();
        assert!(matches!(err, CoreError::IndexTypeMismatch { .. }), "{err:?}");
    });
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn indexed_and_scanned_numeric_lookups_agree(
        prices in prop::collection::vec(0u8..6, 1..8),
        wanted in 0u8..6,
    ) {
        let pool = TestPool::memory();
        let broker = pool.admin();
        let documents: Vec<String> = prices
            .iter()
            .enumerate()
            .map(|(i, p)| item(&format!("p{i}"), "T", &p.to_string(), &p.to_string()))
            .collect();
        load(&broker, &documents);

        let expected = prices.iter().filter(|p| **p == wanted).count();
        let (indexed, scanned) = both(&broker, &format!("//price[. = {wanted}]"));
        prop_assert_eq!(&indexed, &scanned);
        prop_assert_eq!(indexed.matches("<price>").count(), expected);

        let (indexed, scanned) = both(&broker, &format!("//item[@qty = {wanted}]"));
        prop_assert_eq!(indexed, scanned);
    }
}
