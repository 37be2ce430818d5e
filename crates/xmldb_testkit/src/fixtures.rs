//! Test fixtures and pool helpers.
//!
//! Provides convenience functions for setting up test pools, storing
//! documents and running queries.

use std::ops::Deref;
use std::path::Path;
use tempfile::TempDir;
use xmldb_core::query::serialize_items;
use xmldb_core::{
    Broker, BrokerPool, Config, IndexDeclaration, Item, MemoryStorage, NodeAddress, NodeRef,
    Transaction, ADMIN_USER,
};

/// A mixed document with every node kind: 7 elements, 4 attributes,
/// 4 text nodes, a comment and a processing instruction.
pub const SAMPLE_XML: &str = concat!(
    r#"<root a="1"><a b="2">text1<b c="3">text2</b></a>"#,
    r#"<c>text3<!-- comment --><d><?pi data?><e f="4">text4</e></d></c><g/></root>"#,
);

/// Default broker bounds used by the fixtures.
pub const MIN_BROKERS: usize = 1;
/// Default broker bounds used by the fixtures.
pub const MAX_BROKERS: usize = 4;

/// A test pool with automatic cleanup.
pub struct TestPool {
    /// The pool instance.
    pub pool: BrokerPool,
    /// The temporary directory (kept alive to prevent cleanup).
    _temp_dir: Option<TempDir>,
}

impl TestPool {
    /// Creates a pool over a fresh in-memory location.
    pub fn memory() -> Self {
        Self::with_config(Config::new().memory(MemoryStorage::new()))
    }

    /// Creates a pool over a fresh temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config::new().directory(temp_dir.path().join("db"));
        let pool = BrokerPool::configure(MIN_BROKERS, MAX_BROKERS, config)
            .expect("Failed to configure file pool");
        Self {
            pool,
            _temp_dir: Some(temp_dir),
        }
    }

    /// Creates a pool from `config` with the default bounds.
    pub fn with_config(config: Config) -> Self {
        let pool = BrokerPool::configure(MIN_BROKERS, MAX_BROKERS, config)
            .expect("Failed to configure pool");
        Self {
            pool,
            _temp_dir: None,
        }
    }

    /// Returns the database directory if file-based, None if in-memory.
    pub fn path(&self) -> Option<&Path> {
        self._temp_dir.as_ref().map(TempDir::path)
    }

    /// Acquires a broker as the built-in admin.
    pub fn admin(&self) -> Broker {
        self.pool
            .authenticate(ADMIN_USER, "")
            .expect("Failed to authenticate admin")
    }
}

impl Deref for TestPool {
    type Target = BrokerPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl Drop for TestPool {
    fn drop(&mut self) {
        let _ = self.pool.shutdown(true);
    }
}

/// Runs a test with a pool over a fresh in-memory location.
pub fn with_memory_pool<F, R>(f: F) -> R
where
    F: FnOnce(&TestPool) -> R,
{
    let pool = TestPool::memory();
    f(&pool)
}

/// Runs a test with a pool over a fresh temporary directory.
pub fn with_file_pool<F, R>(f: F) -> R
where
    F: FnOnce(&TestPool) -> R,
{
    let pool = TestPool::file();
    f(&pool)
}

/// Stores `xml` as `collection/name` in its own committed transaction,
/// creating the collection if needed.
pub fn store_document(broker: &Broker, collection: &str, name: &str, xml: &str) {
    let mut txn = broker.begin_transaction().expect("Failed to begin");
    let collection = broker
        .get_or_create_collection(&mut txn, collection)
        .expect("Failed to create collection");
    let info = collection
        .validate_resource(&txn, broker, name, xml)
        .expect("Failed to validate document");
    collection
        .store(&mut txn, broker, info, xml, true)
        .expect("Failed to store document");
    broker.commit(&mut txn).expect("Failed to commit");
}

/// Declares indexes on a collection in their own committed transaction.
pub fn declare_indexes(broker: &Broker, collection: &str, declarations: &[IndexDeclaration]) {
    let mut txn = broker.begin_transaction().expect("Failed to begin");
    let mut collection = broker
        .get_or_create_collection(&mut txn, collection)
        .expect("Failed to create collection");
    for declaration in declarations {
        collection.add_index(declaration.clone());
    }
    broker
        .save_collection(&mut txn, &collection)
        .expect("Failed to save collection");
    broker.commit(&mut txn).expect("Failed to commit");
}

/// Runs a query against the committed state.
pub fn query(broker: &Broker, source: &str) -> Vec<Item> {
    broker
        .query_service()
        .query(source)
        .unwrap_or_else(|e| panic!("query failed: {e}\n{source}"))
}

/// Runs a query and returns the string value of every item.
pub fn query_strings(broker: &Broker, source: &str) -> Vec<String> {
    query(broker, source).iter().map(Item::string_value).collect()
}

/// Runs a query and serializes the result.
pub fn query_xml(broker: &Broker, source: &str) -> String {
    serialize_items(&query(broker, source)).expect("Failed to serialize result")
}

/// Runs a query that must return a single integer.
pub fn query_count(broker: &Broker, source: &str) -> i64 {
    let items = query(broker, source);
    match items.as_slice() {
        [item] => item
            .string_value()
            .parse()
            .unwrap_or_else(|_| panic!("not an integer: {item:?}")),
        other => panic!("expected one item, got {}", other.len()),
    }
}

/// Returns the address of the one stored node `source` selects, as `txn`
/// sees the store, or the committed state without one.
pub fn node_address(broker: &Broker, txn: Option<&Transaction>, source: &str) -> NodeAddress {
    let service = broker.query_service();
    let items = match txn {
        Some(txn) => service.query_in(txn, source),
        None => service.query(source),
    }
    .unwrap_or_else(|e| panic!("query failed: {e}\n{source}"));
    match items.as_slice() {
        [item] => item
            .as_node()
            .and_then(NodeRef::address)
            .unwrap_or_else(|| panic!("not a stored node: {item:?}")),
        other => panic!("expected one node, got {}", other.len()),
    }
}
