//! Collection handles and the two-step document store.

use super::path::validate_name;
use super::{document_path, CollectionMeta, StoredDocument};
use crate::dom::{parse_document, Tree};
use crate::error::{CoreError, CoreResult};
use crate::index::IndexDeclaration;
use crate::pool::Broker;
use crate::transaction::Transaction;
use crate::wal::{compute_crc32, JournalRecord};
use std::sync::Arc;
use tracing::debug;

/// A collection as seen by one transaction.
///
/// The handle is a copy: changes made with [`Collection::add_index`] or
/// [`Collection::set_owner`] only take effect once the handle is passed to
/// `Broker::save_collection`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collection {
    path: String,
    meta: CollectionMeta,
}

/// A validated resource, ready to be stored.
///
/// Produced by [`Collection::validate_resource`]; carries the parsed tree so
/// [`Collection::store`] does not parse again.
#[derive(Debug, Clone)]
pub struct IndexInfo {
    collection: String,
    name: String,
    tree: Tree,
    checksum: u32,
}

impl IndexInfo {
    /// Returns the target collection path.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the document name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the CRC32 of the validated source.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Returns the parsed tree.
    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }
}

impl Collection {
    pub(crate) fn new(path: String, meta: CollectionMeta) -> Self {
        Self { path, meta }
    }

    /// Returns the absolute path.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the owning account.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.meta.owner
    }

    /// Returns the index declarations of this collection.
    #[must_use]
    pub fn indexes(&self) -> &[IndexDeclaration] {
        &self.meta.indexes
    }

    pub(crate) fn meta(&self) -> &CollectionMeta {
        &self.meta
    }

    /// Declares an index; ignored if already declared.
    pub fn add_index(&mut self, declaration: IndexDeclaration) {
        if !self.meta.indexes.contains(&declaration) {
            self.meta.indexes.push(declaration);
        }
    }

    /// Removes an index declaration. Returns true if it was declared.
    pub fn remove_index(&mut self, declaration: &IndexDeclaration) -> bool {
        let before = self.meta.indexes.len();
        self.meta.indexes.retain(|d| d != declaration);
        before != self.meta.indexes.len()
    }

    /// Changes the owning account.
    pub fn set_owner(&mut self, owner: impl Into<String>) {
        self.meta.owner = owner.into();
    }

    /// Parses and checks a resource before it is stored.
    ///
    /// # Errors
    ///
    /// - `XmlParse` / `NameCollision` if the source is not well-formed
    /// - `InvalidOperation` for a bad name
    /// - `CollectionNotFound` if the collection is gone in `txn`'s view
    pub fn validate_resource(
        &self,
        txn: &Transaction,
        broker: &Broker,
        name: &str,
        xml: &str,
    ) -> CoreResult<IndexInfo> {
        broker.ensure_usable()?;
        validate_name(name)?;
        if txn.view().collection(&self.path).is_none() {
            return Err(CoreError::CollectionNotFound {
                path: self.path.clone(),
            });
        }
        let tree = parse_document(xml, broker.preserve_whitespace())?;
        Ok(IndexInfo {
            collection: self.path.clone(),
            name: name.to_string(),
            tree,
            checksum: compute_crc32(xml.as_bytes()),
        })
    }

    /// Stores a validated resource.
    ///
    /// With `is_update` an existing document of the same name is replaced;
    /// a missing one is created.
    ///
    /// # Errors
    ///
    /// - `ChecksumMismatch` if `xml` is not the validated source
    /// - `InvalidOperation` if `info` was validated for another collection
    /// - `DocumentExists` if the name is taken and `is_update` is false
    /// - `JournalWrite` if the journal fails, which aborts `txn`
    pub fn store(
        &self,
        txn: &mut Transaction,
        broker: &Broker,
        info: IndexInfo,
        xml: &str,
        is_update: bool,
    ) -> CoreResult<Arc<StoredDocument>> {
        broker.ensure_usable()?;
        if info.collection != self.path {
            return Err(CoreError::invalid_operation(format!(
                "resource was validated for {}, not {}",
                info.collection, self.path
            )));
        }
        let actual = compute_crc32(xml.as_bytes());
        if actual != info.checksum {
            return Err(CoreError::ChecksumMismatch {
                expected: info.checksum,
                actual,
            });
        }

        let path = document_path(&self.path, &info.name);
        let document = broker.allocate_document_id();
        broker.log(
            txn,
            JournalRecord::StoreDocument {
                document,
                collection: info.collection,
                name: info.name,
                owner: broker.subject().name().to_string(),
                tree: info.tree,
                replace: is_update,
            },
        )?;
        debug!(txn = %txn.id(), %path, %document, "document stored");

        txn.view()
            .document(&path)
            .cloned()
            .ok_or(CoreError::DocumentNotFound { path })
    }

    /// Removes a document.
    ///
    /// # Errors
    ///
    /// - `DocumentNotFound` if there is no such document in `txn`'s view
    /// - `JournalWrite` if the journal fails, which aborts `txn`
    pub fn remove_document(
        &self,
        txn: &mut Transaction,
        broker: &Broker,
        name: &str,
    ) -> CoreResult<()> {
        broker.ensure_usable()?;
        broker.log(
            txn,
            JournalRecord::RemoveDocument {
                collection: self.path.clone(),
                name: name.to_string(),
            },
        )?;
        Ok(())
    }

    /// Returns the names of the documents directly inside this collection.
    #[must_use]
    pub fn document_names(&self, txn: &Transaction) -> Vec<String> {
        txn.view()
            .documents_in(&self.path)
            .map(|d| d.name.clone())
            .collect()
    }

    /// Returns the paths of the direct sub-collections.
    #[must_use]
    pub fn child_collections(&self, txn: &Transaction) -> Vec<String> {
        txn.view().child_collections(&self.path)
    }
}
