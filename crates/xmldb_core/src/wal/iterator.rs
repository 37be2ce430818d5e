//! Reading journal entries back for recovery.

use crate::error::{CoreError, CoreResult};
use crate::types::Lsn;
use crate::wal::record::{
    verify_crc, Header, JournalEntry, JournalRecord, RecordKind, CRC_SIZE, HEADER_SIZE,
    JOURNAL_MAGIC, JOURNAL_VERSION,
};
use xmldb_storage::StorageBackend;

/// Iterates over the entries of a journal backend.
///
/// Yields `(offset, entry)` pairs. A torn tail ends iteration cleanly;
/// corruption yields one error and then ends.
pub struct JournalIterator<'a> {
    backend: &'a dyn StorageBackend,
    size: u64,
    offset: u64,
    finished: bool,
}

impl<'a> JournalIterator<'a> {
    /// Starts iterating at offset 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend size cannot be read.
    pub fn new(backend: &'a dyn StorageBackend) -> CoreResult<Self> {
        Ok(Self {
            size: backend.size()?,
            backend,
            offset: 0,
            finished: false,
        })
    }

    /// Returns the offset just past the last complete entry read so far.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_next(&mut self) -> CoreResult<Option<(u64, JournalEntry)>> {
        let start = self.offset;
        let remaining = self.size - start;
        if remaining < HEADER_SIZE as u64 {
            return Ok(None);
        }

        let header_bytes = self.backend.read_at(start, HEADER_SIZE)?;
        let header = Header::parse(&header_bytes, JOURNAL_MAGIC)
            .map_err(|_| CoreError::wal_corruption(format!("invalid magic at offset {start}")))?;
        if header.version == 0 || header.version > JOURNAL_VERSION {
            return Err(CoreError::wal_corruption(format!(
                "unsupported version {} at offset {start}",
                header.version
            )));
        }
        let kind = RecordKind::from_byte(header.kind).ok_or_else(|| {
            CoreError::wal_corruption(format!(
                "unknown record type {} at offset {start}",
                header.kind
            ))
        })?;

        let total = HEADER_SIZE + header.len + CRC_SIZE;
        if remaining < total as u64 {
            return Ok(None);
        }

        let bytes = self.backend.read_at(start, total)?;
        verify_crc(&bytes)?;
        let payload = &bytes[HEADER_SIZE..HEADER_SIZE + header.len];
        let entry = JournalEntry::decode_payload(kind, payload)?;
        self.offset = start + total as u64;
        Ok(Some((start, entry)))
    }
}

impl Iterator for JournalIterator<'_> {
    type Item = CoreResult<(u64, JournalEntry)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// What a full pass over the journal found.
#[derive(Debug, Default)]
pub struct JournalScan {
    /// Every complete entry in log order.
    pub entries: Vec<JournalEntry>,
    /// Length of the readable prefix; bytes beyond it are a torn tail.
    pub valid_len: u64,
    /// Total backend size at scan time.
    pub total_len: u64,
}

impl JournalScan {
    /// Reads the whole journal.
    ///
    /// # Errors
    ///
    /// Returns `Recovery` if the journal is corrupt.
    pub fn read(backend: &dyn StorageBackend) -> CoreResult<Self> {
        let mut iter = JournalIterator::new(backend)?;
        let total_len = iter.size;
        let mut entries = Vec::new();
        for item in iter.by_ref() {
            let (_, entry) =
                item.map_err(|e| CoreError::recovery(format!("unreadable journal: {e}")))?;
            entries.push(entry);
        }
        Ok(Self {
            entries,
            valid_len: iter.offset(),
            total_len,
        })
    }

    /// Returns true if a torn tail follows the last complete entry.
    #[must_use]
    pub fn has_torn_tail(&self) -> bool {
        self.valid_len < self.total_len
    }

    /// Returns the entries after the last checkpoint.
    #[must_use]
    pub fn since_checkpoint(&self) -> &[JournalEntry] {
        let start = self
            .entries
            .iter()
            .rposition(|e| matches!(e.record, JournalRecord::Checkpoint { .. }))
            .map_or(0, |i| i + 1);
        &self.entries[start..]
    }

    /// Returns true if the store was shut down cleanly: the journal is empty
    /// or ends with a checkpoint, with no torn tail.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        !self.has_torn_tail() && self.since_checkpoint().is_empty()
    }

    /// Returns the highest LSN in the journal.
    #[must_use]
    pub fn max_lsn(&self) -> Lsn {
        self.entries.iter().map(|e| e.lsn).max().unwrap_or(Lsn::ZERO)
    }
}
