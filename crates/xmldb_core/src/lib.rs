//! # xmldb Core
//!
//! Embedded transactional store for XML documents with an XQuery evaluator.
//!
//! This crate provides:
//! - an immutable node model shared by stored and constructed trees
//! - a write-ahead journal with snapshot checkpoints and crash recovery
//! - transactions that read their own writes and publish atomically
//! - collections with typed value indexes on element and attribute names
//! - a broker pool handing out authenticated, transaction-capable sessions
//! - a compiled query cache and a tree-walking XQuery evaluator
//!
//! ## Example
//!
//! ```rust
//! use xmldb_core::{BrokerPool, Config, MemoryStorage, ADMIN_USER};
//!
//! let config = Config::new().memory(MemoryStorage::new());
//! let pool = BrokerPool::configure(1, 4, config).unwrap();
//! let broker = pool.authenticate(ADMIN_USER, "").unwrap();
//!
//! let items = broker.query_service().query("for $i in 1 to 3 return $i * 2").unwrap();
//! assert_eq!(xmldb_core::query::serialize_items(&items).unwrap(), "2 4 6");
//!
//! drop(broker);
//! pool.shutdown(false).unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod database;
mod dir;
pub mod dom;
mod error;
pub mod index;
pub mod pool;
pub mod query;
mod stats;
mod storage;
pub mod store;
pub mod transaction;
mod types;
pub mod wal;

pub use config::Config;
pub use database::Database;
pub use dir::{DatabaseDir, FileSnapshots};
pub use dom::{parse_document, InsertPosition, NodeKind, NodeRef, QName, TreeBuilder};
pub use error::{CoreError, CoreResult};
pub use index::{IndexDeclaration, IndexTarget, ValueType};
pub use pool::{Broker, BrokerPool, PoolStatus, Subject, ADMIN_USER, GUEST_USER};
pub use query::{CompiledQuery, Item, QueryService};
pub use stats::{PoolStats, StatsSnapshot};
pub use storage::{MemoryStorage, SnapshotStore, StorageLocation};
pub use store::{Collection, StoreState, StoredDocument};
pub use transaction::{RecoveryReport, Transaction, TransactionState};
pub use types::{DocumentId, Lsn, NodeAddress, TransactionId};
