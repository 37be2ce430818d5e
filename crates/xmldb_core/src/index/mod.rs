//! QName/value index.
//!
//! Collections declare indexes on element or attribute names with a value
//! type. A declaration covers every document in the collection and its
//! sub-collections. Each indexed node's string value is cast to the declared
//! type; nodes whose value does not cast are left out.
//!
//! The index lives inside the committed store state, so entries appear and
//! disappear exactly when the owning transaction commits.
//!
//! # Invariants
//!
//! - every entry points at a node of a committed document
//! - every node covered by a declaration whose value casts has an entry
//! - lookups never conflate numeric and string equality

mod value;

pub use value::{IndexKey, TypedValue, ValueType};
pub(crate) use value::parse_double;

use crate::dom::{NodeKind, NodeRef, QName};
use crate::error::{CoreError, CoreResult};
use crate::types::{DocumentId, NodeAddress};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// The nodes an index declaration covers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexTarget {
    /// Elements with this name, keyed by their string value.
    Element(QName),
    /// Attributes with this name, keyed by their value.
    Attribute(QName),
}

impl IndexTarget {
    fn matches(&self, node: &NodeRef) -> bool {
        match (self, node.kind()) {
            (Self::Element(name), NodeKind::Element)
            | (Self::Attribute(name), NodeKind::Attribute) => {
                node.name() == Some(name)
            }
            _ => false,
        }
    }
}

impl fmt::Display for IndexTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Element(name) => write!(f, "{name}"),
            Self::Attribute(name) => write!(f, "@{name}"),
        }
    }
}

/// An index declared on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexDeclaration {
    /// What is indexed.
    pub target: IndexTarget,
    /// The type values are cast to.
    pub value_type: ValueType,
}

impl IndexDeclaration {
    /// Declares an index on elements named `name`.
    #[must_use]
    pub fn element(name: QName, value_type: ValueType) -> Self {
        Self {
            target: IndexTarget::Element(name),
            value_type,
        }
    }

    /// Declares an index on attributes named `name`.
    #[must_use]
    pub fn attribute(name: QName, value_type: ValueType) -> Self {
        Self {
            target: IndexTarget::Attribute(name),
            value_type,
        }
    }
}

/// Value types declared per target across all collections.
///
/// Lookups are type-checked against the catalog before any entry is read.
#[derive(Debug, Clone, Default)]
pub struct IndexCatalog {
    declared: HashMap<IndexTarget, BTreeSet<ValueType>>,
}

impl IndexCatalog {
    /// Builds the catalog of a set of declarations.
    pub fn from_declarations<'a>(
        declarations: impl IntoIterator<Item = &'a IndexDeclaration>,
    ) -> Self {
        let mut declared: HashMap<IndexTarget, BTreeSet<ValueType>> = HashMap::new();
        for declaration in declarations {
            declared
                .entry(declaration.target.clone())
                .or_default()
                .insert(declaration.value_type);
        }
        Self { declared }
    }

    /// Returns true if any collection declares an index on `target`.
    #[must_use]
    pub fn is_declared(&self, target: &IndexTarget) -> bool {
        self.declared.contains_key(target)
    }

    /// Returns the key `value` is found under, or `None` if `target` is
    /// not declared anywhere.
    ///
    /// # Errors
    ///
    /// Returns `IndexTypeMismatch` if `value` cannot be compared with any type
    /// declared for `target`.
    pub fn key_for(
        &self,
        target: &IndexTarget,
        value: &TypedValue,
    ) -> CoreResult<Option<IndexKey>> {
        let Some(types) = self.declared.get(target) else {
            return Ok(None);
        };
        let actual = value.value_type();
        let Some(declared) = types.iter().find(|t| t.is_comparable_with(actual)) else {
            let expected = types
                .iter()
                .map(|t| t.type_name())
                .collect::<Vec<_>>()
                .join(" | ");
            return Err(CoreError::type_mismatch(expected, actual.type_name()));
        };
        value.key_for(*declared).map(Some)
    }
}

type Slot = (IndexTarget, IndexKey);

/// Entries from `(target, key)` to the addresses of matching nodes.
///
/// One index holds the entries of the documents of one collection.
#[derive(Debug, Clone, Default)]
pub struct QNameIndex {
    entries: HashMap<Slot, BTreeSet<NodeAddress>>,
    /// Slot and node position of every entry a document contributed.
    by_document: HashMap<DocumentId, Vec<(Slot, u32)>>,
}

impl QNameIndex {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a stored document under the declarations that cover it.
    ///
    /// Any entries the document already had are replaced.
    pub fn index_document(&mut self, document: &NodeRef, declarations: &[IndexDeclaration]) {
        let Some(doc_id) = document.document_id() else {
            return;
        };
        self.remove_document(doc_id);
        if declarations.is_empty() {
            return;
        }
        let mut contributed = Vec::new();
        for position in document.tree().positions() {
            self.index_node(document, position, declarations, &mut contributed);
        }
        if !contributed.is_empty() {
            self.by_document.insert(doc_id, contributed);
        }
    }

    /// Refreshes the entries of the nodes at `positions` only.
    ///
    /// Every other node must sit at the same position as when the document
    /// was last indexed.
    pub fn reindex_nodes(
        &mut self,
        document: &NodeRef,
        positions: &BTreeSet<u32>,
        declarations: &[IndexDeclaration],
    ) {
        let Some(doc_id) = document.document_id() else {
            return;
        };
        let mut contributed = self.by_document.remove(&doc_id).unwrap_or_default();
        contributed.retain(|(slot, position)| {
            if !positions.contains(position) {
                return true;
            }
            let address = NodeAddress {
                document: doc_id,
                node: *position,
            };
            drop_entry(&mut self.entries, slot, |a| *a != address);
            false
        });
        for &position in positions {
            self.index_node(document, position, declarations, &mut contributed);
        }
        if !contributed.is_empty() {
            self.by_document.insert(doc_id, contributed);
        }
    }

    fn index_node(
        &mut self,
        document: &NodeRef,
        position: u32,
        declarations: &[IndexDeclaration],
        contributed: &mut Vec<(Slot, u32)>,
    ) {
        let Some(node) = document.sibling_at(position) else {
            return;
        };
        if !matches!(node.kind(), NodeKind::Element | NodeKind::Attribute) {
            return;
        }
        for declaration in declarations.iter().filter(|d| d.target.matches(&node)) {
            let Some(value) = TypedValue::cast(&node.string_value(), declaration.value_type) else {
                continue;
            };
            let key = value.key();
            if key == IndexKey::Unmatchable {
                continue;
            }
            let Some(address) = node.address() else {
                continue;
            };
            let slot = (declaration.target.clone(), key);
            if self.entries.entry(slot.clone()).or_default().insert(address) {
                contributed.push((slot, position));
            }
        }
    }

    /// Drops every entry of a document.
    pub fn remove_document(&mut self, document: DocumentId) {
        let Some(slots) = self.by_document.remove(&document) else {
            return;
        };
        for (slot, _) in slots {
            drop_entry(&mut self.entries, &slot, |a| a.document != document);
        }
    }

    /// Returns the addresses under `(target, key)` in document order.
    pub fn addresses<'a>(
        &'a self,
        target: &IndexTarget,
        key: &IndexKey,
    ) -> impl Iterator<Item = NodeAddress> + 'a {
        self.entries
            .get(&(target.clone(), key.clone()))
            .into_iter()
            .flat_map(|set| set.iter().copied())
    }

    /// Returns the number of distinct `(target, key)` entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is indexed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn drop_entry(
    entries: &mut HashMap<Slot, BTreeSet<NodeAddress>>,
    slot: &Slot,
    keep: impl FnMut(&NodeAddress) -> bool,
) {
    if let Some(addresses) = entries.get_mut(slot) {
        addresses.retain(keep);
        if addresses.is_empty() {
            entries.remove(slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dom::{apply_update, parse_document, NodeUpdate};
    use std::sync::Arc;

    fn stored(id: u64, xml: &str) -> NodeRef {
        let tree = parse_document(xml, false).unwrap();
        NodeRef::stored(Arc::new(tree), DocumentId(id))
    }

    fn declarations() -> Vec<IndexDeclaration> {
        vec![
            IndexDeclaration::element(QName::local("price"), ValueType::Double),
            IndexDeclaration::attribute(QName::local("sku"), ValueType::String),
        ]
    }

    fn lookup(
        index: &QNameIndex,
        catalog: &IndexCatalog,
        target: &IndexTarget,
        value: &TypedValue,
    ) -> CoreResult<Vec<NodeAddress>> {
        Ok(match catalog.key_for(target, value)? {
            Some(key) => index.addresses(target, &key).collect(),
            None => Vec::new(),
        })
    }

    #[test]
    fn numeric_lookup_uses_numeric_equality() {
        let decls = declarations();
        let catalog = IndexCatalog::from_declarations(&decls);
        let mut index = QNameIndex::new();
        index.index_document(
            &stored(
                1,
                concat!(
                    r#"<items><item sku="a"><price>3</price></item>"#,
                    r#"<item sku="b"><price>3.0</price></item>"#,
                    r#"<item><price>n/a</price></item></items>"#,
                ),
            ),
            &decls,
        );

        let target = IndexTarget::Element(QName::local("price"));
        let hits = lookup(&index, &catalog, &target, &TypedValue::Integer(3)).unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits.windows(2).all(|w| w[0] < w[1]));

        let err = lookup(&index, &catalog, &target, &TypedValue::String("3".into())).unwrap_err();
        assert!(matches!(err, CoreError::IndexTypeMismatch { .. }));
    }

    #[test]
    fn attribute_lookup_and_removal() {
        let decls = declarations();
        let catalog = IndexCatalog::from_declarations(&decls);
        let mut index = QNameIndex::new();
        index.index_document(&stored(1, r#"<item sku="a"/>"#), &decls);
        index.index_document(&stored(2, r#"<item sku="a"/>"#), &decls);

        let target = IndexTarget::Attribute(QName::local("sku"));
        let value = TypedValue::String("a".into());
        assert_eq!(lookup(&index, &catalog, &target, &value).unwrap().len(), 2);

        index.remove_document(DocumentId(1));
        let hits = lookup(&index, &catalog, &target, &value).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document, DocumentId(2));

        index.remove_document(DocumentId(2));
        assert!(index.is_empty());
    }

    #[test]
    fn undeclared_target_is_empty() {
        let catalog = IndexCatalog::from_declarations(&declarations());
        let target = IndexTarget::Element(QName::local("other"));
        assert!(!catalog.is_declared(&target));
        let key = catalog
            .key_for(&target, &TypedValue::String("x".into()))
            .unwrap();
        assert!(key.is_none());
    }

    #[test]
    fn reindexed_nodes_replace_only_their_entries() {
        let decls = declarations();
        let catalog = IndexCatalog::from_declarations(&decls);
        let before = stored(1, "<items><price>3</price><price>4</price></items>");
        let mut index = QNameIndex::new();
        index.index_document(&before, &decls);

        // Position 4 is the second price element.
        let updated = apply_update(before.tree(), 4, &NodeUpdate::Value("9".into())).unwrap();
        let after = NodeRef::stored(Arc::new(updated), DocumentId(1));
        let changed: BTreeSet<u32> = [0, 1, 4, 5].into_iter().collect();
        index.reindex_nodes(&after, &changed, &decls);

        let target = IndexTarget::Element(QName::local("price"));
        let price = |n| lookup(&index, &catalog, &target, &TypedValue::Integer(n)).unwrap();
        assert_eq!(price(3).len(), 1);
        assert!(price(4).is_empty());
        assert_eq!(price(9), vec![NodeAddress { document: DocumentId(1), node: 4 }]);

        index.remove_document(DocumentId(1));
        assert!(index.is_empty());
    }
}
