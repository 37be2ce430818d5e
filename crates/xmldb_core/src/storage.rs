//! Storage locations: where a pool keeps its journal and snapshot.

use crate::dir::DatabaseDir;
use crate::error::{CoreError, CoreResult};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use xmldb_storage::{FaultInjector, FaultyBackend, FileBackend, InMemoryBackend, StorageBackend};

/// Holds the committed store image written at each checkpoint.
///
/// `replace` must be atomic: after a crash, `load` returns either the old or
/// the new image, never a mix.
pub trait SnapshotStore: Send + Sync {
    /// Loads the latest image, if one was ever written.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be read.
    fn load(&self) -> CoreResult<Option<Vec<u8>>>;

    /// Atomically replaces the image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written.
    fn replace(&self, data: &[u8]) -> CoreResult<()>;
}

/// Where a database lives.
#[derive(Debug, Clone)]
pub enum StorageLocation {
    /// A directory on disk, locked while a pool uses it.
    Directory(PathBuf),
    /// A shared in-memory location.
    Memory(MemoryStorage),
}

/// An in-memory storage location.
///
/// Clones refer to the same journal bytes, snapshot and claim flag. A pool
/// dropped without shutdown leaves its journal behind, so configuring a new
/// pool on a clone behaves like restarting after a crash.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    journal: InMemoryBackend,
    snapshot: Arc<RwLock<Option<Vec<u8>>>>,
    claimed: Arc<AtomicBool>,
    faults: FaultInjector,
}

impl MemoryStorage {
    /// Creates an empty location.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the fault injector wired into this location's journal.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    /// Returns the raw journal backend.
    #[must_use]
    pub fn journal(&self) -> &InMemoryBackend {
        &self.journal
    }

    /// Returns an unclaimed, independent copy of the journal and snapshot.
    ///
    /// Used to run recovery twice against the same unclean state.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self {
            journal: self.journal.fork(),
            snapshot: Arc::new(RwLock::new(self.snapshot.read().clone())),
            claimed: Arc::new(AtomicBool::new(false)),
            faults: FaultInjector::new(),
        }
    }

    /// Returns whether a pool currently holds this location.
    #[must_use]
    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::SeqCst)
    }
}

impl SnapshotStore for MemoryStorage {
    fn load(&self) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.snapshot.read().clone())
    }

    fn replace(&self, data: &[u8]) -> CoreResult<()> {
        *self.snapshot.write() = Some(data.to_vec());
        Ok(())
    }
}

/// Keeps a location exclusively held until dropped.
#[derive(Debug)]
pub(crate) enum LocationGuard {
    Directory(DatabaseDir),
    Memory(Arc<AtomicBool>),
}

impl Drop for LocationGuard {
    fn drop(&mut self) {
        if let Self::Memory(claimed) = self {
            claimed.store(false, Ordering::SeqCst);
        }
    }
}

/// An opened location: its journal backend, snapshot store and lock.
pub(crate) struct OpenedStorage {
    pub(crate) journal: Box<dyn StorageBackend>,
    pub(crate) snapshots: Box<dyn SnapshotStore>,
    pub(crate) guard: LocationGuard,
}

impl StorageLocation {
    /// Claims the location and opens its backends.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another pool holds the location.
    pub(crate) fn open(&self, create_if_missing: bool) -> CoreResult<OpenedStorage> {
        match self {
            Self::Directory(path) => {
                let dir = DatabaseDir::open(path, create_if_missing)?;
                let journal = FileBackend::open(&dir.journal_path())?;
                Ok(OpenedStorage {
                    journal: Box::new(journal),
                    snapshots: Box::new(dir.snapshot_store()),
                    guard: LocationGuard::Directory(dir),
                })
            }
            Self::Memory(memory) => {
                if memory
                    .claimed
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    return Err(CoreError::DatabaseLocked);
                }
                let journal = FaultyBackend::new(memory.journal.clone(), memory.faults.clone());
                Ok(OpenedStorage {
                    journal: Box::new(journal),
                    snapshots: Box::new(memory.clone()),
                    guard: LocationGuard::Memory(Arc::clone(&memory.claimed)),
                })
            }
        }
    }
}
