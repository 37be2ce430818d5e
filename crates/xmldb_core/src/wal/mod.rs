//! Write-ahead journal for durability and crash recovery.
//!
//! Every mutating operation is journaled before it is applied. On an
//! unclean start, the journal is replayed to restore committed work.
//!
//! ## Entry Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is the CBOR encoding of a [`JournalEntry`]: LSN, owning
//! transaction and [`JournalRecord`].
//!
//! ## Recovery Policy
//!
//! Tolerated, treated as the end of the log:
//!
//! - **Truncated header**: fewer than 11 bytes left
//! - **Truncated payload**: the length runs past the end
//!
//! These are writes torn by a crash. Whatever transaction they belonged to
//! has no durable commit record and is discarded.
//!
//! Fatal, start-up fails with `Recovery`:
//!
//! - **CRC mismatch**
//! - **Invalid magic bytes**
//! - **Unknown record type or version**
//!
//! ## Invariants
//!
//! - entries are appended in LSN order and never rewritten
//! - a commit record is synced before the commit is acknowledged
//! - a journal holding anything after its last checkpoint is unclean

mod iterator;
mod record;
mod writer;

pub use iterator::{JournalIterator, JournalScan};
pub use record::{
    compute_crc32, JournalEntry, JournalRecord, NodeTarget, RecordKind, JOURNAL_MAGIC,
    JOURNAL_VERSION,
};
pub(crate) use record::{from_cbor, seal, to_cbor, verify_crc, Header, CRC_SIZE, HEADER_SIZE};
pub use writer::Journal;
