//! Static and dynamic query contexts.

use super::item::{Item, Sequence};
use super::predeclared_namespaces;
use crate::dom::QName;
use crate::store::StoreState;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Everything compilation depends on.
///
/// Two contexts with the same namespaces and switches share cached plans.
/// The store view is used to evaluate module-level variables at compile
/// time and is not part of the fingerprint.
#[derive(Debug, Clone)]
pub struct StaticContext {
    namespaces: BTreeMap<String, String>,
    host_bindings_enabled: bool,
    max_call_depth: usize,
    view: Arc<StoreState>,
}

impl StaticContext {
    /// Creates a context over `view` with the predeclared prefixes.
    #[must_use]
    pub fn new(view: Arc<StoreState>) -> Self {
        Self {
            namespaces: predeclared_namespaces().into_iter().collect(),
            host_bindings_enabled: false,
            max_call_depth: 256,
            view,
        }
    }

    /// Binds a prefix for every query compiled in this context.
    #[must_use]
    pub fn declare_namespace(mut self, prefix: impl Into<String>, uri: impl Into<String>) -> Self {
        self.namespaces.insert(prefix.into(), uri.into());
        self
    }

    /// Allows or refuses calls into `host:` namespaces.
    #[must_use]
    pub fn host_bindings(mut self, enabled: bool) -> Self {
        self.host_bindings_enabled = enabled;
        self
    }

    /// Limits the nesting of user-defined function calls.
    #[must_use]
    pub fn max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }

    /// Returns true if host bindings may be used.
    #[must_use]
    pub fn host_bindings_enabled(&self) -> bool {
        self.host_bindings_enabled
    }

    /// Returns the call depth limit.
    #[must_use]
    pub fn call_depth_limit(&self) -> usize {
        self.max_call_depth
    }

    /// Returns the store view.
    #[must_use]
    pub fn view(&self) -> &Arc<StoreState> {
        &self.view
    }

    pub(crate) fn bindings(&self) -> Vec<(String, String)> {
        self.namespaces
            .iter()
            .map(|(p, u)| (p.clone(), u.clone()))
            .collect()
    }

    /// Hash of everything that changes how a source compiles.
    pub(crate) fn fingerprint(&self, registry_generation: u64) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.namespaces.hash(&mut hasher);
        self.host_bindings_enabled.hash(&mut hasher);
        self.max_call_depth.hash(&mut hasher);
        registry_generation.hash(&mut hasher);
        hasher.finish()
    }
}

/// Per-execution inputs: the store view, external variable values and the
/// initial context item.
#[derive(Debug, Clone)]
pub struct DynamicContext {
    pub(crate) view: Arc<StoreState>,
    pub(crate) variables: HashMap<QName, Sequence>,
    pub(crate) context_item: Option<Item>,
}

impl DynamicContext {
    /// Creates a context over `view` with no bindings.
    #[must_use]
    pub fn new(view: Arc<StoreState>) -> Self {
        Self {
            view,
            variables: HashMap::new(),
            context_item: None,
        }
    }

    /// Binds an external variable.
    pub fn bind(&mut self, name: QName, value: Sequence) -> &mut Self {
        self.variables.insert(name, value);
        self
    }

    /// Sets the initial context item.
    pub fn set_context_item(&mut self, item: Item) -> &mut Self {
        self.context_item = Some(item);
        self
    }

    /// Returns the store view.
    #[must_use]
    pub fn view(&self) -> &Arc<StoreState> {
        &self.view
    }
}
