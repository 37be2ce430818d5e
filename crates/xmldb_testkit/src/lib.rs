//! # xmldb Testkit
//!
//! Test utilities for xmldb.
//!
//! This crate provides:
//! - Pool fixtures over in-memory and temporary on-disk locations
//! - The canonical mixed-content sample document
//! - A crash/restart harness for recovery tests
//! - Tracing initialisation for test runs
//!
//! The cross-component integration suite lives in `tests/`.
//!
//! ## Usage
//!
//! ```rust
//! use xmldb_testkit::prelude::*;
//!
//! with_memory_pool(|pool| {
//!     let broker = pool.admin();
//!     store_document(&broker, "/db/test", "sample.xml", SAMPLE_XML);
//!     let names = query_strings(&broker, "doc('/db/test/sample.xml')/root/*/name()");
//!     assert_eq!(names, ["a", "c", "g"]);
//! });
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod fixtures;

use tracing_subscriber::EnvFilter;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::fixtures::*;
    pub use crate::init_tracing;
}

pub use crash::*;
pub use fixtures::*;

/// Installs a test-friendly tracing subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
