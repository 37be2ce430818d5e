//! Syntax tree of a parsed query.

use super::functions::{HostBinding, NativeFunction};
use super::item::{Atomic, ArithOp, Comparison};
use crate::dom::{NodeKind, NodeRef, QName};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub(crate) enum Expr {
    Literal(Atomic),
    Sequence(Vec<Expr>),
    Range(Box<Expr>, Box<Expr>),
    Variable(QName),
    ContextItem,
    /// `/` at the start of a path.
    Root,
    /// `lhs/rhs`.
    Path(Box<Expr>, Box<Expr>),
    Step(Step),
    Filter(Box<Expr>, Vec<Expr>),
    Call {
        name: QName,
        args: Vec<Expr>,
        target: CallTarget,
    },
    Arithmetic(ArithOp, Box<Expr>, Box<Expr>),
    Negate(Box<Expr>),
    ValueCompare(Comparison, Box<Expr>, Box<Expr>),
    GeneralCompare(Comparison, Box<Expr>, Box<Expr>),
    NodeCompare(NodeComparison, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    SetOp(SetOp, Box<Expr>, Box<Expr>),
    If(Box<Expr>, Box<Expr>, Box<Expr>),
    Quantified {
        every: bool,
        bindings: Vec<(QName, Expr)>,
        condition: Box<Expr>,
    },
    Flwor(Box<Flwor>),
    Element {
        name: NameExpr,
        attributes: Vec<(QName, Vec<Content>)>,
        content: Vec<Content>,
    },
    Attribute(NameExpr, Vec<Content>),
    Text(Box<Expr>),
    Comment(Vec<Content>),
    ProcessingInstruction(NameExpr, Vec<Content>),
    Document(Box<Expr>),
}

/// Literal text or an enclosed expression inside a constructor.
#[derive(Debug, Clone)]
pub(crate) enum Content {
    Text(String),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub(crate) enum NameExpr {
    Static(QName),
    Computed(Box<Expr>),
}

#[derive(Debug, Clone)]
pub(crate) struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Axis {
    Child,
    Descendant,
    DescendantOrSelf,
    Attribute,
    SelfAxis,
    Following,
    FollowingSibling,
    Parent,
    Ancestor,
    AncestorOrSelf,
    Preceding,
    PrecedingSibling,
}

impl Axis {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "child" => Self::Child,
            "descendant" => Self::Descendant,
            "descendant-or-self" => Self::DescendantOrSelf,
            "attribute" => Self::Attribute,
            "self" => Self::SelfAxis,
            "following" => Self::Following,
            "following-sibling" => Self::FollowingSibling,
            "parent" => Self::Parent,
            "ancestor" => Self::Ancestor,
            "ancestor-or-self" => Self::AncestorOrSelf,
            "preceding" => Self::Preceding,
            "preceding-sibling" => Self::PrecedingSibling,
            _ => return None,
        })
    }

    /// The kind a name test selects on this axis.
    pub(crate) fn principal_kind(self) -> NodeKind {
        if self == Self::Attribute {
            NodeKind::Attribute
        } else {
            NodeKind::Element
        }
    }

    /// Returns the nodes on the axis in axis order: document order for
    /// forward axes, nearest first for reverse ones.
    pub(crate) fn select(self, node: &NodeRef) -> Vec<NodeRef> {
        match self {
            Self::Child => node.children(),
            Self::Descendant => node.descendants(false),
            Self::DescendantOrSelf => node.descendants(true),
            Self::Attribute => node.attributes(),
            Self::SelfAxis => vec![node.clone()],
            Self::Following => node.following(),
            Self::FollowingSibling => node.following_siblings(),
            Self::Parent => node.parent().into_iter().collect(),
            Self::Ancestor => node.ancestors(false),
            Self::AncestorOrSelf => node.ancestors(true),
            Self::Preceding => node.preceding(),
            Self::PrecedingSibling => node.preceding_siblings(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum NodeTest {
    Name(QName),
    /// `*`
    Wildcard,
    /// `*:local`
    AnyNamespace(String),
    /// `prefix:*`, holding the namespace URI.
    AnyLocal(Option<String>),
    Kind(KindTest),
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum KindTest {
    AnyNode,
    Document,
    Element(Option<QName>),
    Attribute(Option<QName>),
    Text,
    Comment,
    ProcessingInstruction(Option<String>),
}

impl NodeTest {
    pub(crate) fn matches(&self, node: &NodeRef, principal: NodeKind) -> bool {
        let name = node.name();
        match self {
            Self::Name(expected) => node.kind() == principal && name == Some(expected),
            Self::Wildcard => node.kind() == principal,
            Self::AnyNamespace(local) => {
                node.kind() == principal && name.is_some_and(|n| &n.local == local)
            }
            Self::AnyLocal(namespace) => {
                node.kind() == principal && name.is_some_and(|n| &n.namespace == namespace)
            }
            Self::Kind(kind) => match kind {
                KindTest::AnyNode => true,
                KindTest::Document => node.kind() == NodeKind::Document,
                KindTest::Text => node.kind() == NodeKind::Text,
                KindTest::Comment => node.kind() == NodeKind::Comment,
                KindTest::Element(expected) => {
                    node.kind() == NodeKind::Element
                        && expected.as_ref().map_or(true, |e| name == Some(e))
                }
                KindTest::Attribute(expected) => {
                    node.kind() == NodeKind::Attribute
                        && expected.as_ref().map_or(true, |e| name == Some(e))
                }
                KindTest::ProcessingInstruction(target) => {
                    node.kind() == NodeKind::ProcessingInstruction
                        && target
                            .as_ref()
                            .map_or(true, |t| name.is_some_and(|n| &n.local == t))
                }
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeComparison {
    Is,
    Precedes,
    Follows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SetOp {
    Union,
    Intersect,
    Except,
}

#[derive(Debug, Clone)]
pub(crate) struct Flwor {
    pub clauses: Vec<Clause>,
    pub condition: Option<Expr>,
    pub order: Vec<OrderSpec>,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub(crate) enum Clause {
    For {
        var: QName,
        position: Option<QName>,
        source: Expr,
    },
    Let {
        var: QName,
        value: Expr,
    },
}

#[derive(Debug, Clone)]
pub(crate) struct OrderSpec {
    pub key: Expr,
    pub descending: bool,
    pub empty_greatest: bool,
}

/// What a function call resolves to. Filled in by the compiler.
#[derive(Clone)]
pub(crate) enum CallTarget {
    Unresolved,
    Builtin(usize),
    User(usize),
    Host(Arc<dyn HostBinding>),
    Extension(Arc<NativeFunction>),
}

impl fmt::Debug for CallTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unresolved => f.write_str("Unresolved"),
            Self::Builtin(i) => write!(f, "Builtin({i})"),
            Self::User(i) => write!(f, "User({i})"),
            Self::Host(_) => f.write_str("Host"),
            Self::Extension(func) => write!(f, "Extension({})", func.name()),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct FunctionDecl {
    pub name: QName,
    pub params: Vec<QName>,
    pub body: Expr,
}

#[derive(Debug, Clone)]
pub(crate) struct VariableDecl {
    pub name: QName,
    /// `None` for `external`.
    pub value: Option<Expr>,
}

/// A parsed main or library module.
#[derive(Debug, Clone, Default)]
pub(crate) struct Module {
    /// Target namespace of a library module.
    pub library: Option<String>,
    pub imports: Vec<String>,
    /// Prefix bindings in scope after the prolog.
    pub namespaces: Vec<(String, String)>,
    pub variables: Vec<VariableDecl>,
    pub functions: Vec<FunctionDecl>,
    pub body: Option<Expr>,
}
