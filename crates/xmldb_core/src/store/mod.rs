//! Committed store state: collections, documents and their index.
//!
//! A [`StoreState`] is an immutable value once published. Commits clone the
//! current state, apply a transaction's operations to the clone, and swap
//! it in whole, so readers holding an `Arc<StoreState>` always see a
//! consistent snapshot.
//!
//! Documents and index entries are sharded by collection behind `Arc`s, so
//! a clone copies one pointer per collection and a write copies only the
//! shard it touches.

mod collection;
mod path;
mod snapshot;

pub use collection::{Collection, IndexInfo};
pub use path::{document_path, normalize_path, parent_path, split_document_path, ROOT_COLLECTION};
pub(crate) use path::validate_name;
pub(crate) use snapshot::{decode_image, encode_image};

use crate::dom::{apply_update, NodeRef, NodeUpdate, Tree};
use crate::error::{CoreError, CoreResult};
use crate::index::{IndexCatalog, IndexDeclaration, IndexTarget, QNameIndex, TypedValue};
use crate::types::{DocumentId, Lsn};
use crate::wal::{JournalRecord, NodeTarget};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// Owner of the root collection and of anything created by the system.
pub const SYSTEM_OWNER: &str = "SYSTEM";

/// Persistent metadata of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionMeta {
    /// Account that owns the collection.
    pub owner: String,
    /// Indexes declared on this collection; they cover its whole subtree.
    pub indexes: Vec<IndexDeclaration>,
}

/// A committed document.
#[derive(Debug, Clone)]
pub struct StoredDocument {
    /// Document id, fixing the document's place in document order.
    pub id: DocumentId,
    /// Path of the owning collection.
    pub collection: String,
    /// Name within the collection.
    pub name: String,
    /// Account that stored the document.
    pub owner: String,
    /// LSN of the journal entry that produced this version.
    pub lsn: Lsn,
    /// The node tree, rooted at a document node.
    pub tree: Arc<Tree>,
}

impl StoredDocument {
    /// Returns the full path of the document.
    #[must_use]
    pub fn path(&self) -> String {
        document_path(&self.collection, &self.name)
    }

    /// Returns the document node.
    #[must_use]
    pub fn root(&self) -> NodeRef {
        NodeRef::stored(Arc::clone(&self.tree), self.id)
    }
}

/// The documents directly inside one collection, with their index entries.
#[derive(Debug, Clone, Default)]
struct Shard {
    documents: BTreeMap<String, Arc<StoredDocument>>,
    by_id: HashMap<DocumentId, String>,
    index: QNameIndex,
}

impl Shard {
    fn by_id(&self, id: DocumentId) -> Option<&Arc<StoredDocument>> {
        self.by_id.get(&id).and_then(|name| self.documents.get(name))
    }
}

/// The full committed state of a database.
#[derive(Debug, Clone)]
pub struct StoreState {
    collections: Arc<BTreeMap<String, CollectionMeta>>,
    shards: BTreeMap<String, Arc<Shard>>,
    catalog: Arc<IndexCatalog>,
    last_commit: Lsn,
    next_document: u64,
}

impl Default for StoreState {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreState {
    /// Creates an empty state holding only the root collection.
    #[must_use]
    pub fn new() -> Self {
        let mut collections = BTreeMap::new();
        collections.insert(
            ROOT_COLLECTION.to_string(),
            CollectionMeta {
                owner: SYSTEM_OWNER.to_string(),
                indexes: Vec::new(),
            },
        );
        Self {
            collections: Arc::new(collections),
            shards: BTreeMap::new(),
            catalog: Arc::default(),
            last_commit: Lsn::ZERO,
            next_document: 1,
        }
    }

    /// Returns the LSN of the last commit reflected in this state.
    #[must_use]
    pub fn last_commit(&self) -> Lsn {
        self.last_commit
    }

    pub(crate) fn set_last_commit(&mut self, lsn: Lsn) {
        self.last_commit = lsn;
    }

    /// Returns the lowest document id not used by this state.
    #[must_use]
    pub fn next_document_id(&self) -> u64 {
        self.next_document
    }

    /// Returns a collection's metadata.
    #[must_use]
    pub fn collection(&self, path: &str) -> Option<&CollectionMeta> {
        self.collections.get(path)
    }

    /// Returns the paths of all collections in path order.
    pub fn collection_paths(&self) -> impl Iterator<Item = &str> {
        self.collections.keys().map(String::as_str)
    }

    /// Returns the direct sub-collections of `path`.
    #[must_use]
    pub fn child_collections(&self, path: &str) -> Vec<String> {
        self.collections
            .keys()
            .filter(|p| parent_path(p).as_deref() == Some(path))
            .cloned()
            .collect()
    }

    /// Returns a document by full path.
    #[must_use]
    pub fn document(&self, path: &str) -> Option<&Arc<StoredDocument>> {
        let (collection, name) = path.rsplit_once('/')?;
        self.shards.get(collection)?.documents.get(name)
    }

    /// Returns a document by id.
    #[must_use]
    pub fn document_by_id(&self, id: DocumentId) -> Option<&Arc<StoredDocument>> {
        self.shards.values().find_map(|shard| shard.by_id(id))
    }

    /// Returns the documents directly inside `collection`, by name.
    pub fn documents_in<'a>(
        &'a self,
        collection: &str,
    ) -> impl Iterator<Item = &'a Arc<StoredDocument>> + 'a {
        self.shards
            .get(collection)
            .into_iter()
            .flat_map(|shard| shard.documents.values())
    }

    /// Returns the documents in `collection` and all its sub-collections.
    pub fn documents_under<'a>(
        &'a self,
        collection: &'a str,
    ) -> impl Iterator<Item = &'a Arc<StoredDocument>> + 'a {
        self.shards
            .iter()
            .filter(move |(path, _)| is_within(path, collection))
            .flat_map(|(_, shard)| shard.documents.values())
    }

    /// Returns every document in id order, which is document order.
    #[must_use]
    pub fn all_documents(&self) -> Vec<Arc<StoredDocument>> {
        let mut docs: Vec<_> = self.documents_under(ROOT_COLLECTION).cloned().collect();
        docs.sort_by_key(|d| d.id);
        docs
    }

    /// Returns true if any collection declares an index on `target`.
    #[must_use]
    pub fn is_index_declared(&self, target: &IndexTarget) -> bool {
        self.catalog.is_declared(target)
    }

    /// Looks up the nodes matching `target` whose typed value equals `value`,
    /// across every collection, in document order.
    ///
    /// An undeclared target has no entries.
    ///
    /// # Errors
    ///
    /// Returns `IndexTypeMismatch` if `value` cannot be compared with any type
    /// declared for `target`.
    pub fn index_lookup(
        &self,
        target: &IndexTarget,
        value: &TypedValue,
    ) -> CoreResult<Vec<NodeRef>> {
        let Some(key) = self.catalog.key_for(target, value)? else {
            return Ok(Vec::new());
        };
        let mut hits = Vec::new();
        for shard in self.shards.values() {
            for address in shard.index.addresses(target, &key) {
                let node = shard
                    .by_id(address.document)
                    .and_then(|doc| doc.root().sibling_at(address.node));
                hits.extend(node);
            }
        }
        hits.sort();
        Ok(hits)
    }

    /// Returns the index declarations covering documents of `collection`:
    /// its own and those of every ancestor.
    #[must_use]
    pub fn declarations_for(&self, collection: &str) -> Vec<IndexDeclaration> {
        let mut out: Vec<IndexDeclaration> = Vec::new();
        for (path, meta) in self.collections.iter() {
            if is_within(collection, path) {
                for declaration in &meta.indexes {
                    if !out.contains(declaration) {
                        out.push(declaration.clone());
                    }
                }
            }
        }
        out
    }

    /// Applies one journaled operation.
    ///
    /// Records that do not mutate the store are ignored.
    ///
    /// # Errors
    ///
    /// - `CollectionNotFound` when writing into or removing a missing collection
    /// - `DocumentExists` when storing or copying onto an existing name without
    ///   `replace`
    /// - `DocumentNotFound` when removing, updating or copying a missing document
    /// - `CollectionExists` when copying onto an existing collection
    /// - `NodeNotFound` when a node update names a position the current
    ///   version of the document does not have
    /// - `InvalidOperation` when removing the root collection, copying a
    ///   collection into itself, or making an update the node kind forbids
    /// - `NameCollision` when a node update duplicates an attribute
    pub fn apply(&mut self, record: &JournalRecord, lsn: Lsn) -> CoreResult<()> {
        if !record.is_node_update() {
            self.check(record)?;
        }
        match record {
            JournalRecord::CreateCollection { path, owner } => {
                self.create_collection(path, owner);
                Ok(())
            }
            JournalRecord::SaveCollection {
                path,
                owner,
                indexes,
            } => {
                self.create_collection(path, owner);
                if let Some(meta) = Arc::make_mut(&mut self.collections).get_mut(path) {
                    meta.owner.clone_from(owner);
                    meta.indexes.clone_from(indexes);
                }
                self.refresh_catalog();
                self.reindex_under(path);
                Ok(())
            }
            JournalRecord::StoreDocument {
                document,
                collection,
                name,
                owner,
                tree,
                ..
            } => {
                self.insert_document(Arc::new(StoredDocument {
                    id: *document,
                    collection: collection.clone(),
                    name: name.clone(),
                    owner: owner.clone(),
                    lsn,
                    tree: Arc::new(tree.clone()),
                }));
                Ok(())
            }
            JournalRecord::RemoveDocument { collection, name } => {
                let shard = self.shard_mut(collection);
                if let Some(removed) = shard.documents.remove(name) {
                    shard.index.remove_document(removed.id);
                    shard.by_id.remove(&removed.id);
                }
                Ok(())
            }
            JournalRecord::RemoveCollection { path } => {
                Arc::make_mut(&mut self.collections).retain(|p, _| !is_within(p, path));
                self.shards.retain(|p, _| !is_within(p, path));
                self.refresh_catalog();
                Ok(())
            }
            JournalRecord::InsertNodes { .. }
            | JournalRecord::ReplaceNode { .. }
            | JournalRecord::UpdateValue { .. }
            | JournalRecord::RemoveNode { .. }
            | JournalRecord::RenameNode { .. } => match record.node_update() {
                Some((target, update)) => self.update_node(target, &update, lsn),
                None => Ok(()),
            },
            JournalRecord::CopyResource {
                source,
                collection,
                name,
                document,
                owner,
            } => {
                let original = self
                    .document(source)
                    .cloned()
                    .ok_or_else(|| CoreError::DocumentNotFound {
                        path: source.clone(),
                    })?;
                self.insert_document(Arc::new(StoredDocument {
                    id: *document,
                    collection: collection.clone(),
                    name: name.clone(),
                    owner: owner.clone(),
                    lsn,
                    tree: Arc::clone(&original.tree),
                }));
                Ok(())
            }
            JournalRecord::CopyCollection {
                source,
                destination,
                owner,
                documents,
            } => {
                self.copy_collection(source, destination, owner, documents, lsn);
                Ok(())
            }
            JournalRecord::Begin
            | JournalRecord::Commit
            | JournalRecord::Abort
            | JournalRecord::Checkpoint { .. } => Ok(()),
        }
    }

    /// Checks that `record` can be applied to this state without applying it.
    ///
    /// # Errors
    ///
    /// The same errors as [`Self::apply`].
    pub fn check(&self, record: &JournalRecord) -> CoreResult<()> {
        match record {
            JournalRecord::StoreDocument {
                collection,
                name,
                replace,
                ..
            } => {
                self.require_collection(collection)?;
                let path = document_path(collection, name);
                if !replace && self.document(&path).is_some() {
                    return Err(CoreError::DocumentExists { path });
                }
                Ok(())
            }
            JournalRecord::RemoveDocument { collection, name } => {
                self.require_document(&document_path(collection, name))
                    .map(|_| ())
            }
            JournalRecord::RemoveCollection { path } => {
                if path == ROOT_COLLECTION {
                    return Err(CoreError::invalid_operation(
                        "the root collection cannot be removed",
                    ));
                }
                self.require_collection(path)
            }
            JournalRecord::CopyResource {
                source,
                collection,
                name,
                ..
            } => {
                self.require_document(source)?;
                self.require_collection(collection)?;
                let path = document_path(collection, name);
                if self.document(&path).is_some() {
                    return Err(CoreError::DocumentExists { path });
                }
                Ok(())
            }
            JournalRecord::CopyCollection {
                source,
                destination,
                documents,
                ..
            } => {
                self.require_collection(source)?;
                if is_within(destination, source) {
                    return Err(CoreError::invalid_operation(format!(
                        "cannot copy {source} into itself"
                    )));
                }
                if self.collections.contains_key(destination) {
                    return Err(CoreError::CollectionExists {
                        path: destination.clone(),
                    });
                }
                if let Some(parent) = parent_path(destination) {
                    self.require_collection(&parent)?;
                }
                for (path, _) in documents {
                    self.require_document(path)?;
                }
                Ok(())
            }
            _ => match record.node_update() {
                Some((target, update)) => self.updated_tree(target, &update).map(|_| ()),
                None => Ok(()),
            },
        }
    }

    fn require_collection(&self, path: &str) -> CoreResult<()> {
        if self.collections.contains_key(path) {
            Ok(())
        } else {
            Err(CoreError::CollectionNotFound {
                path: path.to_string(),
            })
        }
    }

    fn require_document(&self, path: &str) -> CoreResult<&Arc<StoredDocument>> {
        self.document(path).ok_or_else(|| CoreError::DocumentNotFound {
            path: path.to_string(),
        })
    }

    fn shard_mut(&mut self, collection: &str) -> &mut Shard {
        Arc::make_mut(self.shards.entry(collection.to_string()).or_default())
    }

    fn create_collection(&mut self, path: &str, owner: &str) {
        let mut current = Some(path.to_string());
        while let Some(p) = current {
            if self.collections.contains_key(&p) {
                break;
            }
            current = parent_path(&p);
            Arc::make_mut(&mut self.collections).insert(
                p,
                CollectionMeta {
                    owner: owner.to_string(),
                    indexes: Vec::new(),
                },
            );
        }
    }

    fn insert_document(&mut self, doc: Arc<StoredDocument>) {
        self.next_document = self.next_document.max(doc.id.0 + 1);
        let declarations = self.declarations_for(&doc.collection);
        let shard = self.shard_mut(&doc.collection);
        if let Some(old) = shard.documents.get(&doc.name).map(|d| d.id) {
            shard.index.remove_document(old);
            shard.by_id.remove(&old);
        }
        shard.index.index_document(&doc.root(), &declarations);
        shard.by_id.insert(doc.id, doc.name.clone());
        shard.documents.insert(doc.name.clone(), doc);
    }

    /// Resolves a node update against the current version of its document
    /// and returns that document with the updated tree.
    fn updated_tree(
        &self,
        target: &NodeTarget,
        update: &NodeUpdate,
    ) -> CoreResult<(Arc<StoredDocument>, Tree)> {
        let doc = self.require_document(&document_path(&target.collection, &target.name))?;
        let address = target.address;
        let current = doc.id == address.document
            && doc.lsn == target.version
            && (address.node as usize) < doc.tree.len();
        if !current {
            return Err(CoreError::NodeNotFound {
                address: address.to_string(),
            });
        }
        let tree = apply_update(&doc.tree, address.node, update)?;
        Ok((Arc::clone(doc), tree))
    }

    fn update_node(
        &mut self,
        target: &NodeTarget,
        update: &NodeUpdate,
        lsn: Lsn,
    ) -> CoreResult<()> {
        let (doc, tree) = self.updated_tree(target, update)?;
        let keeps_positions = update.keeps_positions(&doc.tree, &tree);
        let updated = Arc::new(StoredDocument {
            lsn,
            tree: Arc::new(tree),
            ..StoredDocument::clone(&doc)
        });
        let declarations = self.declarations_for(&doc.collection);
        let shard = self.shard_mut(&doc.collection);
        let root = updated.root();
        if keeps_positions {
            let changed = changed_positions(&root, target.address.node);
            shard.index.reindex_nodes(&root, &changed, &declarations);
        } else {
            shard.index.index_document(&root, &declarations);
        }
        shard.documents.insert(updated.name.clone(), updated);
        Ok(())
    }

    fn copy_collection(
        &mut self,
        source: &str,
        destination: &str,
        owner: &str,
        documents: &[(String, DocumentId)],
        lsn: Lsn,
    ) {
        let relocate = |path: &str| format!("{destination}{}", &path[source.len()..]);
        let copied: Vec<(String, CollectionMeta)> = self
            .collections
            .iter()
            .filter(|(path, _)| is_within(path, source))
            .map(|(path, meta)| {
                let meta = CollectionMeta {
                    owner: owner.to_string(),
                    indexes: meta.indexes.clone(),
                };
                (relocate(path), meta)
            })
            .collect();
        Arc::make_mut(&mut self.collections).extend(copied);
        self.refresh_catalog();

        for (path, id) in documents {
            let Some(original) = self.document(path).cloned() else {
                continue;
            };
            self.insert_document(Arc::new(StoredDocument {
                id: *id,
                collection: relocate(&original.collection),
                name: original.name.clone(),
                owner: owner.to_string(),
                lsn,
                tree: Arc::clone(&original.tree),
            }));
        }
    }

    fn refresh_catalog(&mut self) {
        let declarations = self.collections.values().flat_map(|meta| meta.indexes.iter());
        self.catalog = Arc::new(IndexCatalog::from_declarations(declarations));
    }

    fn reindex_under(&mut self, collection: &str) {
        let paths: Vec<String> = self
            .shards
            .keys()
            .filter(|path| is_within(path, collection))
            .cloned()
            .collect();
        for path in paths {
            let declarations = self.declarations_for(&path);
            let Shard {
                documents, index, ..
            } = self.shard_mut(&path);
            for doc in documents.values() {
                index.index_document(&doc.root(), &declarations);
            }
        }
    }

    /// Rebuilds a state from persisted parts, reconstructing the index.
    pub(crate) fn from_parts(
        collections: BTreeMap<String, CollectionMeta>,
        documents: Vec<StoredDocument>,
        last_commit: Lsn,
        next_document: u64,
    ) -> Self {
        let mut state = Self::new();
        Arc::make_mut(&mut state.collections).extend(collections);
        state.last_commit = last_commit;
        state.next_document = next_document.max(1);
        state.refresh_catalog();
        for doc in documents {
            state.insert_document(Arc::new(doc));
        }
        state
    }

    pub(crate) fn collections(&self) -> &BTreeMap<String, CollectionMeta> {
        &self.collections
    }
}

/// Positions whose index entries an in-place update can change: the
/// target's subtree and its ancestors.
fn changed_positions(root: &NodeRef, target: u32) -> BTreeSet<u32> {
    let Some(node) = root.sibling_at(target) else {
        return BTreeSet::new();
    };
    let mut positions: BTreeSet<u32> = node.extent().collect();
    positions.extend(node.ancestors(false).iter().map(NodeRef::position));
    positions
}

/// Returns true if `path` equals `ancestor` or lies beneath it.
fn is_within(path: &str, ancestor: &str) -> bool {
    path == ancestor
        || path
            .strip_prefix(ancestor)
            .is_some_and(|rest| rest.starts_with('/'))
}
