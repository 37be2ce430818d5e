//! Brokers: pooled execution contexts.

use super::{PoolInner, PoolStatus};
use crate::dom::{parse_fragment, InsertPosition, QName};
use crate::error::{CoreError, CoreResult};
use crate::pool::security::Subject;
use crate::query::QueryService;
use crate::store::{
    document_path, normalize_path, split_document_path, validate_name, Collection, StoreState,
    StoredDocument, ROOT_COLLECTION,
};
use crate::transaction::{Transaction, TransactionManager};
use crate::types::{DocumentId, Lsn, NodeAddress, TransactionId};
use crate::wal::{JournalRecord, NodeTarget};
use std::cell::Cell;
use std::sync::Arc;
use tracing::debug;

/// An execution context drawn from a [`BrokerPool`](super::BrokerPool).
///
/// A broker is bound to one subject and to at most one active transaction
/// at a time. It can be sent to another thread but not shared between
/// threads. Dropping it returns it to the pool.
pub struct Broker {
    pool: Arc<PoolInner>,
    id: u32,
    subject: Subject,
    current: Cell<Option<TransactionId>>,
}

impl Broker {
    pub(crate) fn new(pool: Arc<PoolInner>, id: u32, subject: Subject) -> Self {
        Self {
            pool,
            id,
            subject,
            current: Cell::new(None),
        }
    }

    /// Returns the broker's slot number within its pool.
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the subject the broker acts for.
    #[must_use]
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    /// Returns the transaction this broker began that is still active.
    #[must_use]
    pub fn current_transaction(&self) -> Option<TransactionId> {
        self.current
            .get()
            .filter(|id| self.manager().is_active(*id))
    }

    pub(crate) fn manager(&self) -> &Arc<TransactionManager> {
        self.pool.database.manager()
    }

    pub(crate) fn pool(&self) -> &Arc<PoolInner> {
        &self.pool
    }

    pub(crate) fn preserve_whitespace(&self) -> bool {
        self.pool.database.config().preserve_whitespace
    }

    /// Work on begun transactions and reads go on while the pool drains.
    pub(crate) fn ensure_usable(&self) -> CoreResult<()> {
        match self.pool.status() {
            PoolStatus::Operational | PoolStatus::ShuttingDown => Ok(()),
            _ => Err(CoreError::PoolClosed),
        }
    }

    fn ensure_operational(&self) -> CoreResult<()> {
        match self.pool.status() {
            PoolStatus::Operational => Ok(()),
            _ => Err(CoreError::PoolClosed),
        }
    }

    pub(crate) fn allocate_document_id(&self) -> DocumentId {
        self.manager().allocate_document_id()
    }

    pub(crate) fn log(&self, txn: &mut Transaction, record: JournalRecord) -> CoreResult<Lsn> {
        self.manager().log(txn, record)
    }

    pub(crate) fn view(&self, txn: Option<&Transaction>) -> Arc<StoreState> {
        match txn {
            Some(txn) => txn.view(),
            None => self.manager().snapshot(),
        }
    }

    /// Begins a transaction bound to this broker.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` if this broker's previous transaction is still active
    /// - `PoolClosed` once shutdown has started
    /// - `JournalWrite` if the journal fails
    pub fn begin_transaction(&self) -> CoreResult<Transaction> {
        self.ensure_operational()?;
        if let Some(active) = self.current_transaction() {
            return Err(CoreError::invalid_operation(format!(
                "broker {} already holds active transaction {active}",
                self.id
            )));
        }
        let txn = self.manager().begin()?;
        self.current.set(Some(txn.id()));
        Ok(txn)
    }

    /// Commits a transaction. See [`TransactionManager::commit`].
    ///
    /// A transaction begun before a graceful shutdown can still commit
    /// while the pool waits for it.
    ///
    /// # Errors
    ///
    /// - `JournalWrite` if the commit could not be made durable, in which
    ///   case the transaction is aborted
    /// - `PoolClosed` once the store is closed; the transaction is aborted
    pub fn commit(&self, txn: &mut Transaction) -> CoreResult<Lsn> {
        self.ensure_usable()?;
        let result = self.manager().commit(txn);
        self.release_transaction(txn.id());
        result
    }

    /// Aborts a transaction. Aborting twice is harmless.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` if the transaction already committed.
    pub fn abort(&self, txn: &mut Transaction) -> CoreResult<()> {
        let result = self.manager().abort(txn);
        self.release_transaction(txn.id());
        result
    }

    fn release_transaction(&self, id: TransactionId) {
        if self.current.get() == Some(id) {
            self.current.set(None);
        }
    }

    /// Returns a collection, creating it and any missing ancestors.
    ///
    /// # Errors
    ///
    /// - `InvalidOperation` for a path outside `/db`
    /// - `JournalWrite` if the journal fails
    pub fn get_or_create_collection(
        &self,
        txn: &mut Transaction,
        path: &str,
    ) -> CoreResult<Collection> {
        self.ensure_usable()?;
        let path = normalize_path(path)?;
        if txn.view().collection(&path).is_none() {
            self.log(
                txn,
                JournalRecord::CreateCollection {
                    path: path.clone(),
                    owner: self.subject.name().to_string(),
                },
            )?;
            debug!(txn = %txn.id(), %path, "collection created");
        }
        self.open_collection(&txn.view(), path)
    }

    /// Returns a collection if it exists, as seen by `txn` or by the
    /// committed state.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a path outside `/db`.
    pub fn get_collection(
        &self,
        txn: Option<&Transaction>,
        path: &str,
    ) -> CoreResult<Option<Collection>> {
        self.ensure_usable()?;
        let path = normalize_path(path)?;
        let view = self.view(txn);
        Ok(view
            .collection(&path)
            .map(|meta| Collection::new(path, meta.clone())))
    }

    fn open_collection(&self, view: &StoreState, path: String) -> CoreResult<Collection> {
        match view.collection(&path) {
            Some(meta) => Ok(Collection::new(path, meta.clone())),
            None => Err(CoreError::CollectionNotFound { path }),
        }
    }

    /// Persists a collection's owner and index declarations.
    ///
    /// Documents under the collection are reindexed when `txn` commits.
    ///
    /// # Errors
    ///
    /// `JournalWrite` if the journal fails.
    pub fn save_collection(
        &self,
        txn: &mut Transaction,
        collection: &Collection,
    ) -> CoreResult<()> {
        self.ensure_usable()?;
        let meta = collection.meta();
        self.log(
            txn,
            JournalRecord::SaveCollection {
                path: collection.path().to_string(),
                owner: meta.owner.clone(),
                indexes: meta.indexes.clone(),
            },
        )?;
        Ok(())
    }

    /// Removes a collection with its sub-collections and documents.
    ///
    /// # Errors
    ///
    /// - `CollectionNotFound`, or `InvalidOperation` for `/db`
    /// - `JournalWrite` if the journal fails
    pub fn remove_collection(&self, txn: &mut Transaction, path: &str) -> CoreResult<()> {
        self.ensure_usable()?;
        let path = normalize_path(path)?;
        self.log(txn, JournalRecord::RemoveCollection { path })?;
        Ok(())
    }

    /// Returns a document by full path.
    ///
    /// # Errors
    ///
    /// `InvalidOperation` for a malformed path.
    pub fn get_document(
        &self,
        txn: Option<&Transaction>,
        path: &str,
    ) -> CoreResult<Option<Arc<StoredDocument>>> {
        self.ensure_usable()?;
        let (collection, name) = split_document_path(path)?;
        let full = document_path(&collection, &name);
        Ok(self.view(txn).document(&full).cloned())
    }

    /// Removes a document by full path.
    ///
    /// # Errors
    ///
    /// - `DocumentNotFound` if it does not exist
    /// - `JournalWrite` if the journal fails
    pub fn remove_document(&self, txn: &mut Transaction, path: &str) -> CoreResult<()> {
        self.ensure_usable()?;
        let (collection, name) = split_document_path(path)?;
        self.log(txn, JournalRecord::RemoveDocument { collection, name })?;
        Ok(())
    }

    /// Returns the names of the documents directly inside a collection.
    ///
    /// # Errors
    ///
    /// `CollectionNotFound` if the collection does not exist.
    pub fn list_documents(
        &self,
        txn: Option<&Transaction>,
        collection: &str,
    ) -> CoreResult<Vec<String>> {
        self.ensure_usable()?;
        let path = normalize_path(collection)?;
        let view = self.view(txn);
        if view.collection(&path).is_none() {
            return Err(CoreError::CollectionNotFound { path });
        }
        Ok(view.documents_in(&path).map(|d| d.name.clone()).collect())
    }

    /// Copies a document into `destination`, under `new_name` or its own name.
    ///
    /// The copy gets a new document id and is owned by this broker's subject.
    ///
    /// # Errors
    ///
    /// - `DocumentNotFound` / `CollectionNotFound` for a missing source or
    ///   destination
    /// - `DocumentExists` if the destination already holds that name
    /// - `JournalWrite` if the journal fails
    pub fn copy_resource(
        &self,
        txn: &mut Transaction,
        source: &str,
        destination: &str,
        new_name: Option<&str>,
    ) -> CoreResult<Arc<StoredDocument>> {
        self.ensure_usable()?;
        let (source_collection, source_name) = split_document_path(source)?;
        let collection = normalize_path(destination)?;
        let name = match new_name {
            Some(name) => {
                validate_name(name)?;
                name.to_string()
            }
            None => source_name.clone(),
        };
        let path = document_path(&collection, &name);
        let record = JournalRecord::CopyResource {
            source: document_path(&source_collection, &source_name),
            collection,
            name,
            document: self.allocate_document_id(),
            owner: self.subject.name().to_string(),
        };
        self.log(txn, record)?;
        debug!(txn = %txn.id(), %source, %path, "document copied");
        let copy = txn.view().document(&path).cloned();
        copy.ok_or(CoreError::DocumentNotFound { path })
    }

    /// Copies a collection with its sub-collections and documents into
    /// `destination`, under `new_name` or its own name.
    ///
    /// Every copied document gets a new id. Index declarations travel with
    /// the copied collections.
    ///
    /// # Errors
    ///
    /// - `CollectionNotFound` for a missing source or destination
    /// - `CollectionExists` if the target path is taken
    /// - `InvalidOperation` for copying `/db` or copying a collection into
    ///   its own subtree
    /// - `JournalWrite` if the journal fails
    pub fn copy_collection(
        &self,
        txn: &mut Transaction,
        source: &str,
        destination: &str,
        new_name: Option<&str>,
    ) -> CoreResult<Collection> {
        self.ensure_usable()?;
        let source = normalize_path(source)?;
        if source == ROOT_COLLECTION {
            return Err(CoreError::invalid_operation("the root collection cannot be copied"));
        }
        let name = match new_name {
            Some(name) => name,
            None => source.rsplit('/').next().unwrap_or_default(),
        };
        validate_name(name)?;
        let target = format!("{}/{name}", normalize_path(destination)?);

        let documents: Vec<(String, DocumentId)> = txn
            .view()
            .documents_under(&source)
            .map(|doc| (doc.path(), self.allocate_document_id()))
            .collect();
        let copied = documents.len();
        let record = JournalRecord::CopyCollection {
            source: source.clone(),
            destination: target.clone(),
            owner: self.subject.name().to_string(),
            documents,
        };
        self.log(txn, record)?;
        debug!(txn = %txn.id(), %source, %target, documents = copied, "collection copied");
        self.open_collection(&txn.view(), target)
    }

    /// Inserts the nodes of an XML fragment before, after or into the node
    /// at `address`.
    ///
    /// Nodes after the insertion point move to higher positions, so
    /// addresses into the document taken before the call must be looked up
    /// again.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if `address` does not name a node of the document
    ///   as `txn` sees it
    /// - `InvalidOperation` if the node kind forbids the insert
    /// - `XmlParse` if `xml` is not well-formed
    /// - `JournalWrite` if the journal fails
    pub fn insert_nodes(
        &self,
        txn: &mut Transaction,
        address: NodeAddress,
        position: InsertPosition,
        xml: &str,
    ) -> CoreResult<()> {
        let content = parse_fragment(xml, self.preserve_whitespace())?;
        let target = self.node_target(txn, address)?;
        self.log_node_update(
            txn,
            JournalRecord::InsertNodes {
                target,
                position,
                content,
            },
        )
    }

    /// Replaces the node at `address` and its subtree with the nodes of an
    /// XML fragment.
    ///
    /// # Errors
    ///
    /// The errors of [`Self::insert_nodes`]. Replacing the root element by
    /// anything but a single element is an `InvalidOperation`.
    pub fn replace_node(
        &self,
        txn: &mut Transaction,
        address: NodeAddress,
        xml: &str,
    ) -> CoreResult<()> {
        let content = parse_fragment(xml, self.preserve_whitespace())?;
        let target = self.node_target(txn, address)?;
        self.log_node_update(txn, JournalRecord::ReplaceNode { target, content })
    }

    /// Sets the value of the node at `address`. An element's children are
    /// replaced by a single text node.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if `address` does not resolve
    /// - `InvalidOperation` for the document node
    /// - `JournalWrite` if the journal fails
    pub fn update_value(
        &self,
        txn: &mut Transaction,
        address: NodeAddress,
        value: &str,
    ) -> CoreResult<()> {
        let target = self.node_target(txn, address)?;
        let record = JournalRecord::UpdateValue {
            target,
            value: value.to_string(),
        };
        self.log_node_update(txn, record)
    }

    /// Removes the node at `address` with its subtree.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if `address` does not resolve
    /// - `InvalidOperation` for the document node or the root element
    /// - `JournalWrite` if the journal fails
    pub fn remove_node(&self, txn: &mut Transaction, address: NodeAddress) -> CoreResult<()> {
        let target = self.node_target(txn, address)?;
        self.log_node_update(txn, JournalRecord::RemoveNode { target })
    }

    /// Renames the element, attribute or processing instruction at `address`.
    ///
    /// # Errors
    ///
    /// - `NodeNotFound` if `address` does not resolve
    /// - `InvalidOperation` for nodes without a name
    /// - `NameCollision` if an attribute of that name already exists
    /// - `JournalWrite` if the journal fails
    pub fn rename_node(
        &self,
        txn: &mut Transaction,
        address: NodeAddress,
        name: QName,
    ) -> CoreResult<()> {
        let target = self.node_target(txn, address)?;
        self.log_node_update(txn, JournalRecord::RenameNode { target, name })
    }

    /// Pins `address` to the version of its document that `txn` sees.
    fn node_target(&self, txn: &Transaction, address: NodeAddress) -> CoreResult<NodeTarget> {
        self.ensure_usable()?;
        let view = txn.view();
        let doc = view
            .document_by_id(address.document)
            .filter(|doc| (address.node as usize) < doc.tree.len())
            .ok_or_else(|| CoreError::NodeNotFound {
                address: address.to_string(),
            })?;
        Ok(NodeTarget {
            collection: doc.collection.clone(),
            name: doc.name.clone(),
            address,
            version: doc.lsn,
        })
    }

    fn log_node_update(&self, txn: &mut Transaction, record: JournalRecord) -> CoreResult<()> {
        let kind = record.kind();
        self.log(txn, record)?;
        debug!(txn = %txn.id(), ?kind, "node updated");
        Ok(())
    }

    /// Returns the query service of this broker.
    #[must_use]
    pub fn query_service(&self) -> QueryService<'_> {
        QueryService::new(self)
    }

    /// Writes buffered journal entries out; with `force` also syncs them.
    ///
    /// # Errors
    ///
    /// `JournalWrite` if the journal fails.
    pub fn flush_to_log(&self, force: bool) -> CoreResult<()> {
        self.ensure_usable()?;
        self.manager().flush_to_log(force)
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.pool.release_slot(self.id);
    }
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("id", &self.id)
            .field("subject", &self.subject.name())
            .field("transaction", &self.current.get())
            .finish()
    }
}
