//! Arena trees and node references.

use super::{NodeKind, QName};
use crate::types::{DocumentId, NodeAddress};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

static NEXT_CONSTRUCTED: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct NodeData {
    pub(crate) kind: NodeKind,
    pub(crate) name: Option<QName>,
    pub(crate) value: String,
    pub(crate) parent: Option<u32>,
    pub(crate) attributes: Vec<u32>,
    pub(crate) children: Vec<u32>,
    /// Last position inside this node's subtree.
    pub(crate) end: u32,
}

impl NodeData {
    pub(crate) fn new(
        kind: NodeKind,
        name: Option<QName>,
        value: String,
        parent: Option<u32>,
    ) -> Self {
        Self {
            kind,
            name,
            value,
            parent,
            attributes: Vec::new(),
            children: Vec::new(),
            end: 0,
        }
    }
}

/// An immutable tree of nodes laid out in document order.
///
/// Position 0 is the root. For a stored document it is the document node;
/// a constructed tree may be rooted at any kind of node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub(crate) nodes: Vec<NodeData>,
}

impl Tree {
    /// Returns the number of nodes, attributes included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the tree has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns the kind of the root node.
    #[must_use]
    pub fn root_kind(&self) -> Option<NodeKind> {
        self.nodes.first().map(|n| n.kind)
    }

    pub(crate) fn node(&self, index: u32) -> &NodeData {
        &self.nodes[index as usize]
    }

    /// Concatenated text of the subtree rooted at `index`.
    pub(crate) fn string_value(&self, index: u32) -> String {
        let node = self.node(index);
        match node.kind {
            NodeKind::Document | NodeKind::Element => {
                let mut out = String::new();
                for pos in index + 1..=node.end {
                    let inner = self.node(pos);
                    if inner.kind == NodeKind::Text {
                        out.push_str(&inner.value);
                    }
                }
                out
            }
            _ => node.value.clone(),
        }
    }

    /// Iterates over every node position in the tree.
    pub(crate) fn positions(&self) -> std::ops::Range<u32> {
        0..self.nodes.len() as u32
    }
}

/// Where a tree came from, which fixes its place in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TreeOrigin {
    /// A committed document.
    Stored(DocumentId),
    /// A tree built during query evaluation, numbered in creation order.
    Constructed(u64),
}

/// A reference to one node of a tree.
///
/// Two references are the same node when they share origin and position.
#[derive(Clone)]
pub struct NodeRef {
    tree: Arc<Tree>,
    origin: TreeOrigin,
    index: u32,
}

impl NodeRef {
    /// References the root of a stored document tree.
    #[must_use]
    pub fn stored(tree: Arc<Tree>, document: DocumentId) -> Self {
        Self {
            tree,
            origin: TreeOrigin::Stored(document),
            index: 0,
        }
    }

    /// Takes ownership of a freshly built tree and references its root.
    #[must_use]
    pub fn constructed(tree: Tree) -> Self {
        let id = NEXT_CONSTRUCTED.fetch_add(1, AtomicOrdering::Relaxed);
        Self {
            tree: Arc::new(tree),
            origin: TreeOrigin::Constructed(id),
            index: 0,
        }
    }

    fn at(&self, index: u32) -> Self {
        Self {
            tree: Arc::clone(&self.tree),
            origin: self.origin,
            index,
        }
    }

    fn data(&self) -> &NodeData {
        self.tree.node(self.index)
    }

    /// Returns the node's kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        self.data().kind
    }

    /// Returns the node's name: element and attribute names, PI targets.
    #[must_use]
    pub fn name(&self) -> Option<&QName> {
        self.data().name.as_ref()
    }

    /// Returns the string value of the node.
    #[must_use]
    pub fn string_value(&self) -> String {
        self.tree.string_value(self.index)
    }

    /// Returns the node's own value: text, comment, attribute value or PI data.
    #[must_use]
    pub fn raw_value(&self) -> &str {
        &self.data().value
    }

    /// Returns the tree origin.
    #[must_use]
    pub fn origin(&self) -> TreeOrigin {
        self.origin
    }

    /// Returns the position of the node within its tree.
    #[must_use]
    pub fn position(&self) -> u32 {
        self.index
    }

    /// Returns the tree this node belongs to.
    #[must_use]
    pub fn tree(&self) -> &Arc<Tree> {
        &self.tree
    }

    /// Returns the owning document if the node is stored.
    #[must_use]
    pub fn document_id(&self) -> Option<DocumentId> {
        match self.origin {
            TreeOrigin::Stored(id) => Some(id),
            TreeOrigin::Constructed(_) => None,
        }
    }

    /// Returns the stable address of a stored node.
    #[must_use]
    pub fn address(&self) -> Option<NodeAddress> {
        self.document_id().map(|document| NodeAddress {
            document,
            node: self.index,
        })
    }

    /// Returns the node at `position` in the same tree.
    #[must_use]
    pub fn sibling_at(&self, position: u32) -> Option<Self> {
        ((position as usize) < self.tree.len()).then(|| self.at(position))
    }

    /// Returns true if `position` lies in the subtree rooted here,
    /// attributes included.
    pub(crate) fn spans(&self, position: u32) -> bool {
        position >= self.index && position <= self.data().end
    }

    /// Returns the positions of the subtree rooted here, attributes included.
    pub(crate) fn extent(&self) -> std::ops::RangeInclusive<u32> {
        self.index..=self.data().end
    }

    /// Returns the parent node.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        self.data().parent.map(|p| self.at(p))
    }

    /// Returns the root of the tree.
    #[must_use]
    pub fn root(&self) -> Self {
        self.at(0)
    }

    /// Returns the attribute nodes of an element.
    #[must_use]
    pub fn attributes(&self) -> Vec<Self> {
        self.data().attributes.iter().map(|&a| self.at(a)).collect()
    }

    /// Returns the child nodes.
    #[must_use]
    pub fn children(&self) -> Vec<Self> {
        self.data().children.iter().map(|&c| self.at(c)).collect()
    }

    /// Returns the descendants in document order, attributes excluded.
    #[must_use]
    pub fn descendants(&self, include_self: bool) -> Vec<Self> {
        let start = if include_self { self.index } else { self.index + 1 };
        (start..=self.data().end)
            .filter(|&pos| pos == self.index || self.tree.node(pos).kind != NodeKind::Attribute)
            .map(|pos| self.at(pos))
            .collect()
    }

    /// Returns the ancestors, nearest first.
    #[must_use]
    pub fn ancestors(&self, include_self: bool) -> Vec<Self> {
        let mut out = Vec::new();
        if include_self {
            out.push(self.clone());
        }
        let mut current = self.data().parent;
        while let Some(pos) = current {
            out.push(self.at(pos));
            current = self.tree.node(pos).parent;
        }
        out
    }

    /// Returns the following siblings in document order.
    #[must_use]
    pub fn following_siblings(&self) -> Vec<Self> {
        self.siblings(|pos, me| pos > me)
    }

    /// Returns the preceding siblings, nearest first.
    #[must_use]
    pub fn preceding_siblings(&self) -> Vec<Self> {
        let mut out = self.siblings(|pos, me| pos < me);
        out.reverse();
        out
    }

    fn siblings(&self, keep: impl Fn(u32, u32) -> bool) -> Vec<Self> {
        if self.kind() == NodeKind::Attribute {
            return Vec::new();
        }
        match self.data().parent {
            Some(parent) => self
                .tree
                .node(parent)
                .children
                .iter()
                .filter(|&&pos| keep(pos, self.index))
                .map(|&pos| self.at(pos))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Returns the nodes after this one in document order that are not its
    /// descendants, attributes excluded.
    #[must_use]
    pub fn following(&self) -> Vec<Self> {
        let after = self.data().end + 1;
        (after..self.tree.len() as u32)
            .filter(|&pos| self.tree.node(pos).kind != NodeKind::Attribute)
            .map(|pos| self.at(pos))
            .collect()
    }

    /// Returns the nodes before this one that are not its ancestors, nearest
    /// first, attributes excluded.
    #[must_use]
    pub fn preceding(&self) -> Vec<Self> {
        let ancestors: Vec<u32> = self.ancestors(false).iter().map(|a| a.index).collect();
        (0..self.index)
            .rev()
            .filter(|pos| !ancestors.contains(pos))
            .filter(|&pos| self.tree.node(pos).kind != NodeKind::Attribute)
            .map(|pos| self.at(pos))
            .collect()
    }
}

impl PartialEq for NodeRef {
    fn eq(&self, other: &Self) -> bool {
        self.origin == other.origin && self.index == other.index
    }
}

impl Eq for NodeRef {}

impl PartialOrd for NodeRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for NodeRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.origin
            .cmp(&other.origin)
            .then_with(|| self.index.cmp(&other.index))
    }
}

impl std::hash::Hash for NodeRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.origin.hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRef")
            .field("origin", &self.origin)
            .field("position", &self.index)
            .field("kind", &self.kind())
            .field("name", &self.name().map(QName::lexical))
            .finish()
    }
}
