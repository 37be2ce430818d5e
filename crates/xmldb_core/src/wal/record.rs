//! Journal record types and the on-disk envelope.

use crate::dom::{InsertPosition, NodeUpdate, QName, Tree};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDeclaration;
use crate::types::{DocumentId, Lsn, NodeAddress, TransactionId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Magic bytes identifying a journal entry.
pub const JOURNAL_MAGIC: [u8; 4] = *b"XJNL";

/// Current journal format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + type (1) + length (4)
pub(crate) const HEADER_SIZE: usize = 11;

pub(crate) const CRC_SIZE: usize = 4;

/// Type byte of a journal entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordKind {
    /// Transaction start.
    Begin = 1,
    /// Collection creation.
    CreateCollection = 2,
    /// Collection metadata update.
    SaveCollection = 3,
    /// Document store or replace.
    StoreDocument = 4,
    /// Document removal.
    RemoveDocument = 5,
    /// Collection subtree removal.
    RemoveCollection = 6,
    /// Transaction commit.
    Commit = 7,
    /// Transaction abort.
    Abort = 8,
    /// Checkpoint marker.
    Checkpoint = 9,
    /// Nodes inserted next to or into a stored node.
    InsertNodes = 10,
    /// Stored node replaced by new content.
    ReplaceNode = 11,
    /// Value of a stored node changed.
    UpdateValue = 12,
    /// Stored node removed.
    RemoveNode = 13,
    /// Stored node renamed.
    RenameNode = 14,
    /// Document copied.
    CopyResource = 15,
    /// Collection subtree copied.
    CopyCollection = 16,
}

impl RecordKind {
    /// Converts a byte to a record kind.
    #[must_use]
    pub fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => Self::Begin,
            2 => Self::CreateCollection,
            3 => Self::SaveCollection,
            4 => Self::StoreDocument,
            5 => Self::RemoveDocument,
            6 => Self::RemoveCollection,
            7 => Self::Commit,
            8 => Self::Abort,
            9 => Self::Checkpoint,
            10 => Self::InsertNodes,
            11 => Self::ReplaceNode,
            12 => Self::UpdateValue,
            13 => Self::RemoveNode,
            14 => Self::RenameNode,
            15 => Self::CopyResource,
            16 => Self::CopyCollection,
            _ => return None,
        })
    }

    /// Converts the kind to its byte.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self as u8
    }
}

/// A node of one version of a stored document.
///
/// Once the document is replaced or updated by another operation the
/// target no longer resolves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeTarget {
    /// Owning collection path.
    pub collection: String,
    /// Document name.
    pub name: String,
    /// Document id and node position.
    pub address: NodeAddress,
    /// LSN of the document version the position refers to.
    pub version: Lsn,
}

/// One logical operation recorded in the journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JournalRecord {
    /// A transaction started.
    Begin,

    /// A collection and any missing ancestors were created.
    CreateCollection {
        /// Absolute collection path.
        path: String,
        /// Owner of the created collections.
        owner: String,
    },

    /// A collection's metadata was saved.
    SaveCollection {
        /// Absolute collection path.
        path: String,
        /// Owner account.
        owner: String,
        /// Declared indexes.
        indexes: Vec<IndexDeclaration>,
    },

    /// A document was stored.
    StoreDocument {
        /// Id assigned to this version of the document.
        document: DocumentId,
        /// Owning collection path.
        collection: String,
        /// Document name.
        name: String,
        /// Account that stored it.
        owner: String,
        /// The parsed tree.
        tree: Tree,
        /// Whether an existing document of the same name is replaced.
        replace: bool,
    },

    /// A document was removed.
    RemoveDocument {
        /// Owning collection path.
        collection: String,
        /// Document name.
        name: String,
    },

    /// A collection and everything beneath it was removed.
    RemoveCollection {
        /// Absolute collection path.
        path: String,
    },

    /// Nodes were inserted relative to a stored node.
    InsertNodes {
        /// The node inserted at.
        target: NodeTarget,
        /// Placement relative to the target.
        position: InsertPosition,
        /// The inserted nodes, as children of a document node.
        content: Tree,
    },

    /// A stored node was replaced.
    ReplaceNode {
        /// The replaced node.
        target: NodeTarget,
        /// The replacement nodes, as children of a document node.
        content: Tree,
    },

    /// A stored node's value was set.
    UpdateValue {
        /// The updated node.
        target: NodeTarget,
        /// The new value.
        value: String,
    },

    /// A stored node was removed with its subtree.
    RemoveNode {
        /// The removed node.
        target: NodeTarget,
    },

    /// A stored node was renamed.
    RenameNode {
        /// The renamed node.
        target: NodeTarget,
        /// The new name.
        name: QName,
    },

    /// A document was copied.
    CopyResource {
        /// Full path of the source document.
        source: String,
        /// Destination collection path.
        collection: String,
        /// Name of the copy.
        name: String,
        /// Id assigned to the copy.
        document: DocumentId,
        /// Account that owns the copy.
        owner: String,
    },

    /// A collection and everything beneath it was copied.
    CopyCollection {
        /// Path of the source collection.
        source: String,
        /// Path of the new collection.
        destination: String,
        /// Account that owns the copies.
        owner: String,
        /// Full source path and new id of every copied document.
        documents: Vec<(String, DocumentId)>,
    },

    /// A transaction committed.
    Commit,

    /// A transaction aborted.
    Abort,

    /// The store image was written; nothing before this entry is needed.
    Checkpoint {
        /// Last commit contained in the image.
        last_commit: Lsn,
    },
}

impl JournalRecord {
    /// Returns the record's kind.
    #[must_use]
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::Begin => RecordKind::Begin,
            Self::CreateCollection { .. } => RecordKind::CreateCollection,
            Self::SaveCollection { .. } => RecordKind::SaveCollection,
            Self::StoreDocument { .. } => RecordKind::StoreDocument,
            Self::RemoveDocument { .. } => RecordKind::RemoveDocument,
            Self::RemoveCollection { .. } => RecordKind::RemoveCollection,
            Self::Commit => RecordKind::Commit,
            Self::Abort => RecordKind::Abort,
            Self::Checkpoint { .. } => RecordKind::Checkpoint,
            Self::InsertNodes { .. } => RecordKind::InsertNodes,
            Self::ReplaceNode { .. } => RecordKind::ReplaceNode,
            Self::UpdateValue { .. } => RecordKind::UpdateValue,
            Self::RemoveNode { .. } => RecordKind::RemoveNode,
            Self::RenameNode { .. } => RecordKind::RenameNode,
            Self::CopyResource { .. } => RecordKind::CopyResource,
            Self::CopyCollection { .. } => RecordKind::CopyCollection,
        }
    }

    /// Returns true for records that change nodes inside a stored document.
    #[must_use]
    pub fn is_node_update(&self) -> bool {
        matches!(
            self,
            Self::InsertNodes { .. }
                | Self::ReplaceNode { .. }
                | Self::UpdateValue { .. }
                | Self::RemoveNode { .. }
                | Self::RenameNode { .. }
        )
    }

    /// Returns the target and the change for node-level records.
    #[must_use]
    pub fn node_update(&self) -> Option<(&NodeTarget, NodeUpdate)> {
        Some(match self {
            Self::InsertNodes {
                target,
                position,
                content,
            } => (
                target,
                NodeUpdate::Insert {
                    position: *position,
                    content: content.clone(),
                },
            ),
            Self::ReplaceNode { target, content } => (
                target,
                NodeUpdate::Replace {
                    content: content.clone(),
                },
            ),
            Self::UpdateValue { target, value } => (target, NodeUpdate::Value(value.clone())),
            Self::RemoveNode { target } => (target, NodeUpdate::Remove),
            Self::RenameNode { target, name } => (target, NodeUpdate::Rename(name.clone())),
            _ => return None,
        })
    }

    /// Returns true for records that change the store when applied.
    #[must_use]
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            Self::Begin | Self::Commit | Self::Abort | Self::Checkpoint { .. }
        )
    }
}

/// A journal record with its LSN and owning transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Position in the total order of entries.
    pub lsn: Lsn,
    /// Owning transaction; `None` for checkpoints.
    pub txn: Option<TransactionId>,
    /// The operation.
    pub record: JournalRecord,
}

impl JournalEntry {
    /// Encodes the entry with its envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized or exceeds 4 GiB.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let payload = to_cbor(self)?;
        seal(JOURNAL_MAGIC, JOURNAL_VERSION, self.record.kind().as_byte(), &payload)
    }

    /// Decodes an entry payload whose envelope has already been checked.
    ///
    /// # Errors
    ///
    /// Returns `WalCorruption` if the payload is malformed or disagrees with
    /// the envelope's type byte.
    pub fn decode_payload(kind: RecordKind, payload: &[u8]) -> CoreResult<Self> {
        let entry: Self = from_cbor(payload)
            .map_err(|e| CoreError::wal_corruption(format!("undecodable entry: {e}")))?;
        if entry.record.kind() != kind {
            return Err(CoreError::wal_corruption(format!(
                "entry {} has type byte {:?} but holds {:?}",
                entry.lsn,
                kind,
                entry.record.kind()
            )));
        }
        Ok(entry)
    }
}

/// Computes the CRC32 checksum of data.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Wraps `payload` in `magic | version | type | length | payload | crc32`.
pub(crate) fn seal(magic: [u8; 4], version: u16, kind: u8, payload: &[u8]) -> CoreResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| CoreError::invalid_operation("record payload too large"))?;

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    data.extend_from_slice(&magic);
    data.extend_from_slice(&version.to_le_bytes());
    data.push(kind);
    data.extend_from_slice(&len.to_le_bytes());
    data.extend_from_slice(payload);
    let crc = compute_crc32(&data);
    data.extend_from_slice(&crc.to_le_bytes());
    Ok(data)
}

/// Parsed envelope header.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Header {
    pub(crate) version: u16,
    pub(crate) kind: u8,
    pub(crate) len: usize,
}

impl Header {
    /// Parses a header, checking the magic.
    pub(crate) fn parse(bytes: &[u8], magic: [u8; 4]) -> CoreResult<Self> {
        if bytes.len() < HEADER_SIZE || bytes[0..4] != magic {
            return Err(CoreError::wal_corruption("invalid magic"));
        }
        Ok(Self {
            version: u16::from_le_bytes([bytes[4], bytes[5]]),
            kind: bytes[6],
            len: u32::from_le_bytes([bytes[7], bytes[8], bytes[9], bytes[10]]) as usize,
        })
    }
}

/// Checks the trailing checksum of a complete envelope.
pub(crate) fn verify_crc(record: &[u8]) -> CoreResult<()> {
    let split = record.len() - CRC_SIZE;
    let (body, crc) = record.split_at(split);
    let expected = u32::from_le_bytes([crc[0], crc[1], crc[2], crc[3]]);
    let actual = compute_crc32(body);
    if expected != actual {
        return Err(CoreError::ChecksumMismatch { expected, actual });
    }
    Ok(())
}

pub(crate) fn to_cbor<T: Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out)
        .map_err(|e| CoreError::invalid_format(format!("CBOR encoding failed: {e}")))?;
    Ok(out)
}

pub(crate) fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    ciborium::from_reader(bytes)
        .map_err(|e| CoreError::invalid_format(format!("CBOR decoding failed: {e}")))
}
