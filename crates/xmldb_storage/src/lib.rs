//! # xmldb Storage
//!
//! Byte-store backends underneath the xmldb journal.
//!
//! Backends are **opaque byte stores**: they append, read back and flush bytes
//! and know nothing about journal records, document trees or snapshots.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - shared in-memory buffer, survives a simulated restart
//! - [`FileBackend`] - persistent storage using OS file APIs
//! - [`FaultyBackend`] - wrapper that fails appends or flushes on request
//!
//! ## Example
//!
//! ```rust
//! use xmldb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! let offset = backend.append(b"<journal/>").unwrap();
//! let data = backend.read_at(offset, 10).unwrap();
//! assert_eq!(&data, b"<journal/>");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod faulty;
mod file;
mod memory;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use faulty::{FaultInjector, FaultyBackend};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
