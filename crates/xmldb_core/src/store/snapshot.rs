//! Store images written at checkpoints.

use super::{CollectionMeta, StoreState, StoredDocument};
use crate::dom::Tree;
use crate::error::{CoreError, CoreResult};
use crate::types::{DocumentId, Lsn};
use crate::wal::{from_cbor, seal, to_cbor, verify_crc, Header, CRC_SIZE, HEADER_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

const IMAGE_MAGIC: [u8; 4] = *b"XSNP";
const IMAGE_VERSION: u16 = 1;
const IMAGE_KIND: u8 = 1;

#[derive(Serialize, Deserialize)]
struct StoreImage {
    last_commit: Lsn,
    next_document: u64,
    collections: BTreeMap<String, CollectionMeta>,
    documents: Vec<DocumentImage>,
}

#[derive(Serialize, Deserialize)]
struct DocumentImage {
    id: DocumentId,
    collection: String,
    name: String,
    owner: String,
    lsn: Lsn,
    tree: Arc<Tree>,
}

/// Encodes the committed state. The index is not stored; it is rebuilt on load.
pub(crate) fn encode_image(state: &StoreState) -> CoreResult<Vec<u8>> {
    let image = StoreImage {
        last_commit: state.last_commit(),
        next_document: state.next_document_id(),
        collections: state.collections().clone(),
        documents: state
            .all_documents()
            .iter()
            .map(|d| DocumentImage {
                id: d.id,
                collection: d.collection.clone(),
                name: d.name.clone(),
                owner: d.owner.clone(),
                lsn: d.lsn,
                tree: Arc::clone(&d.tree),
            })
            .collect(),
    };
    seal(IMAGE_MAGIC, IMAGE_VERSION, IMAGE_KIND, &to_cbor(&image)?)
}

/// Decodes an image written by [`encode_image`].
pub(crate) fn decode_image(bytes: &[u8]) -> CoreResult<StoreState> {
    let header = Header::parse(bytes, IMAGE_MAGIC)
        .map_err(|_| CoreError::invalid_format("store image has bad magic"))?;
    if header.version != IMAGE_VERSION || header.kind != IMAGE_KIND {
        return Err(CoreError::invalid_format(format!(
            "unsupported store image version {}",
            header.version
        )));
    }
    let total = HEADER_SIZE + header.len + CRC_SIZE;
    if bytes.len() != total {
        return Err(CoreError::invalid_format("store image is truncated"));
    }
    verify_crc(bytes)?;

    let image: StoreImage = from_cbor(&bytes[HEADER_SIZE..HEADER_SIZE + header.len])?;
    let documents = image
        .documents
        .into_iter()
        .map(|d| StoredDocument {
            id: d.id,
            collection: d.collection,
            name: d.name,
            owner: d.owner,
            lsn: d.lsn,
            tree: d.tree,
        })
        .collect();
    Ok(StoreState::from_parts(
        image.collections,
        documents,
        image.last_commit,
        image.next_document,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{parse_document, QName};
    use crate::index::{IndexDeclaration, IndexTarget, TypedValue, ValueType};
    use crate::wal::JournalRecord;

    #[test]
    fn image_restores_documents_and_index() {
        let mut state = StoreState::new();
        state
            .apply(
                &JournalRecord::SaveCollection {
                    path: "/db/shop".into(),
                    owner: "admin".into(),
                    indexes: vec![IndexDeclaration::attribute(
                        QName::local("id"),
                        ValueType::Integer,
                    )],
                },
                Lsn(1),
            )
            .unwrap();
        state
            .apply(
                &JournalRecord::StoreDocument {
                    document: DocumentId(7),
                    collection: "/db/shop".into(),
                    name: "a.xml".into(),
                    owner: "admin".into(),
                    tree: parse_document(r#"<item id="12"/>"#, false).unwrap(),
                    replace: false,
                },
                Lsn(2),
            )
            .unwrap();
        state.set_last_commit(Lsn(3));

        let restored = decode_image(&encode_image(&state).unwrap()).unwrap();
        assert_eq!(restored.last_commit(), Lsn(3));
        assert_eq!(restored.next_document_id(), 8);
        assert_eq!(restored.document("/db/shop/a.xml").unwrap().id, DocumentId(7));
        let hits = restored
            .index_lookup(
                &IndexTarget::Attribute(QName::local("id")),
                &TypedValue::Integer(12),
            )
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn corrupt_image_is_rejected() {
        let mut bytes = encode_image(&StoreState::new()).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(decode_image(&bytes).is_err());
        assert!(decode_image(b"junk").is_err());
    }
}
