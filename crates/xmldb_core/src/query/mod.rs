//! Query compilation, evaluation and the compiled query cache.
//!
//! A query goes through three stages:
//!
//! 1. [`QueryPool::compile`] parses the source, resolves every name and
//!    function call against the static context, and evaluates module-level
//!    variables once. The result is an immutable [`CompiledQuery`], cached
//!    by source text and static context fingerprint.
//! 2. [`QueryPool::execute`] runs a plan against a [`DynamicContext`]. Every
//!    execution gets fresh per-execution state (counters, call depth), so a
//!    cached plan can be run again, or from several threads at once, without
//!    one run observing another.
//! 3. Results are [`Sequence`]s of nodes and atomic values;
//!    [`serialize_items`] turns them into XML text.
//!
//! Most callers go through a broker's [`QueryService`].
//!
//! # Predeclared prefixes
//!
//! | prefix  | namespace                                  |
//! |---------|--------------------------------------------|
//! | `xml`   | `http://www.w3.org/XML/1998/namespace`     |
//! | `xs`    | `http://www.w3.org/2001/XMLSchema`         |
//! | `fn`    | `http://www.w3.org/2005/xpath-functions`   |
//! | `local` | `http://www.w3.org/2005/xquery-local-functions` |
//! | `util`  | `urn:xmldb:util`                           |
//!
//! Functions in namespaces that start with `host:` are dispatched to a
//! registered [`HostBinding`], and only when host bindings are enabled.

mod ast;
mod cache;
mod compile;
mod context;
mod eval;
mod functions;
mod item;
mod parser;
mod service;

pub use cache::QueryPool;
pub use compile::CompiledQuery;
pub use context::{DynamicContext, StaticContext};
pub use functions::{HostBinding, NativeFunction};
pub use item::{atomize, effective_boolean, format_double, Atomic, Item, Sequence};
pub use service::QueryService;

use crate::dom::{serialize_node, XML_NAMESPACE};
use crate::error::CoreResult;

/// Namespace of the built-in functions.
pub const FN_NAMESPACE: &str = "http://www.w3.org/2005/xpath-functions";
/// Namespace of the XML Schema types and their constructor functions.
pub const XS_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema";
/// Namespace for functions declared in a main module.
pub const LOCAL_NAMESPACE: &str = "http://www.w3.org/2005/xquery-local-functions";
/// Namespace of the utility functions.
pub const UTIL_NAMESPACE: &str = "urn:xmldb:util";
/// Scheme of namespaces served by host bindings.
pub const HOST_SCHEME: &str = "host:";

pub(crate) fn predeclared_namespaces() -> Vec<(String, String)> {
    [
        ("xml", XML_NAMESPACE),
        ("xs", XS_NAMESPACE),
        ("fn", FN_NAMESPACE),
        ("local", LOCAL_NAMESPACE),
        ("util", UTIL_NAMESPACE),
    ]
    .into_iter()
    .map(|(p, u)| (p.to_string(), u.to_string()))
    .collect()
}

/// Serializes a result sequence.
///
/// Nodes are written as XML; adjacent atomic values are separated by a
/// single space.
///
/// # Errors
///
/// Propagates node serialization errors.
pub fn serialize_items(items: &[Item]) -> CoreResult<String> {
    let mut out = String::new();
    let mut after_atomic = false;
    for item in items {
        match item {
            Item::Node(node) => {
                out.push_str(&serialize_node(node)?);
                after_atomic = false;
            }
            Item::Atomic(atomic) => {
                if after_atomic {
                    out.push(' ');
                }
                out.push_str(&atomic.to_string());
                after_atomic = true;
            }
        }
    }
    Ok(out)
}
