//! Database configuration.

use crate::storage::{MemoryStorage, StorageLocation};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a broker pool and the store underneath it.
#[derive(Debug, Clone)]
pub struct Config {
    /// Where the journal and snapshot live.
    pub storage: StorageLocation,

    /// Whether to create a database directory that doesn't exist.
    pub create_if_missing: bool,

    /// Whether a commit syncs the journal to disk before returning.
    pub sync_on_commit: bool,

    /// Bytes of journal entries buffered in memory before they are written out.
    pub journal_buffer_size: usize,

    /// Journal size that triggers an automatic checkpoint after a commit.
    pub journal_size_limit: u64,

    /// How long `acquire` waits for a free broker.
    pub acquire_timeout: Duration,

    /// How long a graceful shutdown waits for in-flight transactions.
    pub shutdown_timeout: Duration,

    /// Maximum number of compiled queries kept in the query pool.
    pub query_cache_capacity: usize,

    /// Whether functions in `host:` namespaces may be bound.
    pub host_bindings_enabled: bool,

    /// Keep whitespace-only text nodes when parsing stored documents.
    pub preserve_whitespace: bool,

    /// Maximum nesting of user-defined function calls.
    pub max_call_depth: usize,

    /// Skip the shutdown checkpoint and the final journal flush, leaving the
    /// store unclean so the next start runs recovery. For fault testing.
    pub force_corruption: bool,

    /// Password of the built-in `admin` account.
    pub admin_password: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageLocation::Memory(MemoryStorage::new()),
            create_if_missing: true,
            sync_on_commit: true,
            journal_buffer_size: 64 * 1024,
            journal_size_limit: 32 * 1024 * 1024,
            acquire_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            query_cache_capacity: 128,
            host_bindings_enabled: false,
            preserve_whitespace: false,
            max_call_depth: 256,
            force_corruption: false,
            admin_password: String::new(),
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the database in the given directory.
    #[must_use]
    pub fn directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = StorageLocation::Directory(path.into());
        self
    }

    /// Stores the database in the given in-memory location.
    #[must_use]
    pub fn memory(mut self, storage: MemoryStorage) -> Self {
        self.storage = StorageLocation::Memory(storage);
        self
    }

    /// Sets whether to create the database directory if missing.
    #[must_use]
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the journal on every commit.
    #[must_use]
    pub fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the journal buffer size.
    #[must_use]
    pub fn journal_buffer_size(mut self, bytes: usize) -> Self {
        self.journal_buffer_size = bytes;
        self
    }

    /// Sets the journal size that triggers a checkpoint.
    #[must_use]
    pub fn journal_size_limit(mut self, bytes: u64) -> Self {
        self.journal_size_limit = bytes;
        self
    }

    /// Sets how long `acquire` waits for a free broker.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Sets how long a graceful shutdown waits for transactions.
    #[must_use]
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the compiled query cache capacity.
    #[must_use]
    pub fn query_cache_capacity(mut self, capacity: usize) -> Self {
        self.query_cache_capacity = capacity;
        self
    }

    /// Enables or disables host bindings.
    #[must_use]
    pub fn host_bindings_enabled(mut self, value: bool) -> Self {
        self.host_bindings_enabled = value;
        self
    }

    /// Sets whether whitespace-only text nodes are kept.
    #[must_use]
    pub fn preserve_whitespace(mut self, value: bool) -> Self {
        self.preserve_whitespace = value;
        self
    }

    /// Sets the maximum function call depth.
    #[must_use]
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Enables the fault-testing mode that leaves the store unclean on shutdown.
    #[must_use]
    pub fn force_corruption(mut self, value: bool) -> Self {
        self.force_corruption = value;
        self
    }

    /// Sets the password of the built-in `admin` account.
    #[must_use]
    pub fn admin_password(mut self, password: impl Into<String>) -> Self {
        self.admin_password = password.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert!(!config.host_bindings_enabled);
        assert!(!config.force_corruption);
        assert!(matches!(config.storage, StorageLocation::Memory(_)));
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .directory("/tmp/xmldb")
            .sync_on_commit(false)
            .query_cache_capacity(4)
            .acquire_timeout(Duration::from_millis(50));

        assert!(!config.sync_on_commit);
        assert_eq!(config.query_cache_capacity, 4);
        assert_eq!(config.acquire_timeout, Duration::from_millis(50));
        assert!(matches!(
            config.storage,
            StorageLocation::Directory(ref p) if p.ends_with("xmldb")
        ));
    }
}
