//! XML node model.
//!
//! Stored and constructed nodes share one representation: an immutable
//! arena [`Tree`] whose nodes are laid out in document order (an element,
//! then its attributes, then its children). A [`NodeRef`] points into a tree
//! and carries the tree's [`TreeOrigin`]:
//!
//! - `Stored(doc)` trees belong to a committed document and order by
//!   document id, then position
//! - `Constructed(n)` trees are built during evaluation and order by
//!   creation, after every stored node
//!
//! Trees are only ever produced by [`TreeBuilder`], which enforces the
//! construction rules (unique attribute names, attributes before content,
//! merged adjacent text).

mod builder;
mod edit;
mod parse;
mod serialize;
mod tree;

pub use builder::TreeBuilder;
pub use edit::{apply_update, check_update, InsertPosition, NodeUpdate};
pub use parse::{parse_document, parse_fragment};
pub(crate) use parse::unescape;
pub use serialize::{serialize_node, serialize_sequence};
pub use tree::{NodeRef, Tree, TreeOrigin};

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Namespace bound to the `xml` prefix.
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// The kind of an XML node. Every node has exactly one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Root document node.
    Document,
    /// Element node.
    Element,
    /// Attribute node.
    Attribute,
    /// Text node.
    Text,
    /// Comment node.
    Comment,
    /// Processing instruction node.
    ProcessingInstruction,
}

impl NodeKind {
    /// Returns the kind test name used in queries, e.g. `processing-instruction`.
    #[must_use]
    pub fn test_name(self) -> &'static str {
        match self {
            Self::Document => "document-node",
            Self::Element => "element",
            Self::Attribute => "attribute",
            Self::Text => "text",
            Self::Comment => "comment",
            Self::ProcessingInstruction => "processing-instruction",
        }
    }
}

/// A qualified name.
///
/// Equality, hashing and ordering use the expanded name (namespace URI plus
/// local part); the prefix is kept only for serialization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QName {
    /// Prefix as written in the source, if any.
    pub prefix: Option<String>,
    /// Local part.
    pub local: String,
    /// Namespace URI, `None` for no namespace.
    pub namespace: Option<String>,
}

impl QName {
    /// Creates a name in no namespace.
    pub fn local(local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            namespace: None,
        }
    }

    /// Creates a namespaced name without a prefix.
    pub fn namespaced(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self {
            prefix: None,
            local: local.into(),
            namespace: Some(namespace.into()),
        }
    }

    /// Returns the same name carrying `prefix`.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Returns the name as written: `prefix:local` or `local`.
    #[must_use]
    pub fn lexical(&self) -> String {
        match &self.prefix {
            Some(prefix) if !prefix.is_empty() => format!("{prefix}:{}", self.local),
            _ => self.local.clone(),
        }
    }

    /// Returns the namespace URI or the empty string.
    #[must_use]
    pub fn namespace_uri(&self) -> &str {
        self.namespace.as_deref().unwrap_or("")
    }
}

impl PartialEq for QName {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.namespace == other.namespace
    }
}

impl Eq for QName {}

impl Hash for QName {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.local.hash(state);
    }
}

impl PartialOrd for QName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.namespace
            .cmp(&other.namespace)
            .then_with(|| self.local.cmp(&other.local))
    }
}

impl fmt::Display for QName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) if self.prefix.is_none() => write!(f, "Q{{{ns}}}{}", self.local),
            _ => f.write_str(&self.lexical()),
        }
    }
}
