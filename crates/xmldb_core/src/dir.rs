//! Database directory management.
//!
//! On-disk layout of a database:
//!
//! ```text
//! <db_path>/
//! ├─ LOCK               # Advisory lock, one pool per directory
//! ├─ journal.log        # Write-ahead journal
//! └─ store.snapshot     # Committed state as of the last checkpoint
//! ```

use crate::error::{CoreError, CoreResult};
use crate::storage::SnapshotStore;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const JOURNAL_FILE: &str = "journal.log";
const SNAPSHOT_FILE: &str = "store.snapshot";
const SNAPSHOT_TEMP: &str = "store.snapshot.tmp";

/// An opened database directory holding the exclusive lock.
///
/// Only one `DatabaseDir` can exist per directory at a time; the lock is
/// released when the value is dropped.
#[derive(Debug)]
pub struct DatabaseDir {
    path: PathBuf,
    _lock_file: File,
}

impl DatabaseDir {
    /// Opens or creates a database directory and takes its lock.
    ///
    /// # Errors
    ///
    /// - `InvalidFormat` if the directory is missing and `create_if_missing` is false,
    ///   or the path is not a directory
    /// - `DatabaseLocked` if another pool holds the lock
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::invalid_format(format!(
                    "database directory does not exist: {}",
                    path.display()
                )));
            }
        }

        if !path.is_dir() {
            return Err(CoreError::invalid_format(format!(
                "path is not a directory: {}",
                path.display()
            )));
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the path to the database directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the path to the journal file.
    #[must_use]
    pub fn journal_path(&self) -> PathBuf {
        self.path.join(JOURNAL_FILE)
    }

    /// Returns a snapshot store writing into this directory.
    #[must_use]
    pub fn snapshot_store(&self) -> FileSnapshots {
        FileSnapshots {
            dir: self.path.clone(),
        }
    }
}

/// Snapshot store over `store.snapshot`, replaced by write-then-rename.
#[derive(Debug, Clone)]
pub struct FileSnapshots {
    dir: PathBuf,
}

impl FileSnapshots {
    #[cfg(unix)]
    fn sync_directory(&self) -> CoreResult<()> {
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> CoreResult<()> {
        Ok(())
    }
}

impl SnapshotStore for FileSnapshots {
    fn load(&self) -> CoreResult<Option<Vec<u8>>> {
        let path = self.dir.join(SNAPSHOT_FILE);
        if !path.exists() {
            return Ok(None);
        }

        let mut data = Vec::new();
        File::open(&path)?.read_to_end(&mut data)?;
        Ok(if data.is_empty() { None } else { Some(data) })
    }

    fn replace(&self, data: &[u8]) -> CoreResult<()> {
        let temp_path = self.dir.join(SNAPSHOT_TEMP);
        let mut file = File::create(&temp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, self.dir.join(SNAPSHOT_FILE))?;
        self.sync_directory()
    }
}
