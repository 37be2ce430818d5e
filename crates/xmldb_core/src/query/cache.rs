//! Pool of compiled queries shared by every broker of a database.

use super::ast::Module;
use super::compile::{compile, CompiledQuery};
use super::context::{DynamicContext, StaticContext};
use super::eval::{Evaluator, ExecutionState};
use super::functions::{is_builtin_namespace, HostBinding, NativeFunction};
use super::item::Sequence;
use super::parser::parse_module;
use super::{predeclared_namespaces, HOST_SCHEME, LOCAL_NAMESPACE};
use crate::dom::QName;
use crate::error::{CoreError, CoreResult};
use crate::stats::PoolStats;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Everything registered on a pool that queries can resolve against.
///
/// `generation` changes on every registration and is part of each plan's
/// cache key, so plans never outlive the registrations they were resolved
/// against.
#[derive(Default)]
pub(crate) struct Registry {
    pub modules: HashMap<String, Arc<Module>>,
    pub host: HashMap<String, Arc<dyn HostBinding>>,
    pub functions: HashMap<(QName, usize), Arc<NativeFunction>>,
    pub generation: u64,
}

struct CacheEntry {
    plan: Arc<CompiledQuery>,
    last_used: AtomicU64,
}

/// Caches compiled plans by source text and static context.
///
/// Lookups and inserts are lock-free per entry. When the cache is full the
/// least recently used plan is evicted.
pub struct QueryPool {
    entries: DashMap<(String, u64), CacheEntry>,
    tick: AtomicU64,
    capacity: usize,
    stats: Arc<PoolStats>,
    registry: RwLock<Registry>,
}

impl QueryPool {
    /// Creates an empty pool holding at most `capacity` plans. A capacity of
    /// zero disables caching.
    #[must_use]
    pub fn new(capacity: usize, stats: Arc<PoolStats>) -> Self {
        Self {
            entries: DashMap::new(),
            tick: AtomicU64::new(0),
            capacity,
            stats,
            registry: RwLock::new(Registry::default()),
        }
    }

    /// Returns the plan for `source` under `context`, compiling it on a miss.
    ///
    /// # Errors
    ///
    /// Returns `QueryCompilation` for syntax and resolution errors,
    /// `BindingDisabled` when the query calls a host namespace while host
    /// bindings are off, and any error raised while evaluating module-level
    /// variables.
    pub fn compile(&self, context: &StaticContext, source: &str) -> CoreResult<Arc<CompiledQuery>> {
        let registry = self.registry.read();
        let key = (source.to_string(), context.fingerprint(registry.generation));
        let now = self.tick.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = self.entries.get(&key) {
            entry.last_used.store(now, Ordering::Relaxed);
            self.stats.record_cache_hit();
            trace!(fingerprint = key.1, "query cache hit");
            return Ok(Arc::clone(&entry.plan));
        }

        self.stats.record_cache_miss();
        let plan = Arc::new(compile(source, context, &registry)?);
        self.stats.record_compile();
        trace!(fingerprint = key.1, "query compiled");

        if self.capacity > 0 {
            self.make_room();
            self.entries.insert(
                key,
                CacheEntry {
                    plan: Arc::clone(&plan),
                    last_used: AtomicU64::new(now),
                },
            );
        }
        Ok(plan)
    }

    fn make_room(&self) {
        while self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|e| e.last_used.load(Ordering::Relaxed))
                .map(|e| e.key().clone());
            let Some(oldest) = oldest else {
                return;
            };
            if self.entries.remove(&oldest).is_some() {
                self.stats.record_cache_eviction();
                trace!(fingerprint = oldest.1, "evicted query plan");
            }
        }
    }

    /// Executes a plan.
    ///
    /// Every execution starts from fresh state: counters restart and the
    /// call depth is zero. The plan itself is not modified.
    ///
    /// # Errors
    ///
    /// Returns `Evaluation` errors raised by the query, including
    /// `XPDY0002` when an external variable is not bound.
    pub fn execute(&self, plan: &CompiledQuery, context: &DynamicContext) -> CoreResult<Sequence> {
        if let Some(missing) = plan
            .external_variables()
            .iter()
            .find(|name| !context.variables.contains_key(*name))
        {
            return Err(CoreError::evaluation(
                "XPDY0002",
                format!("external variable ${} is not bound", missing.lexical()),
            ));
        }

        let mut state = ExecutionState::new();
        let result = Evaluator::new(
            plan.program(),
            plan.globals(),
            &context.variables,
            &context.view,
            &mut state,
        )
        .with_context_item(context.context_item.clone())
        .eval(&plan.program().body);
        self.stats.record_execute();
        result
    }

    /// Returns the number of cached plans.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no plan is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the maximum number of cached plans.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every cached plan.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Registers a library module so main modules can import it.
    ///
    /// Returns the module's target namespace. Registering a namespace again
    /// replaces the earlier module.
    ///
    /// # Errors
    ///
    /// Returns `QueryCompilation` if `source` does not parse or is not a
    /// library module.
    pub fn register_module(&self, source: &str) -> CoreResult<String> {
        let module = parse_module(source, &predeclared_namespaces())?;
        let Some(namespace) = module.library.clone() else {
            return Err(CoreError::compilation(
                "XPST0003",
                "expected a library module ('module namespace ...')",
            ));
        };
        self.update_registry(|registry| {
            registry.modules.insert(namespace.clone(), Arc::new(module));
        });
        debug!(%namespace, "registered library module");
        Ok(namespace)
    }

    /// Registers the binding serving a `host:` namespace.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` if `namespace` does not use the `host:`
    /// scheme.
    pub fn register_host_binding(
        &self,
        namespace: &str,
        binding: Arc<dyn HostBinding>,
    ) -> CoreResult<()> {
        if !namespace.starts_with(HOST_SCHEME) {
            return Err(CoreError::invalid_operation(format!(
                "host binding namespace '{namespace}' must start with '{HOST_SCHEME}'"
            )));
        }
        self.update_registry(|registry| {
            registry.host.insert(namespace.to_string(), binding);
        });
        debug!(namespace, "registered host binding");
        Ok(())
    }

    /// Registers a native function.
    ///
    /// # Errors
    ///
    /// Returns `InvalidOperation` for names in a reserved namespace: the
    /// built-in library, `local` and `host:` namespaces.
    pub fn register_function(&self, function: NativeFunction) -> CoreResult<()> {
        let namespace = function.name().namespace_uri();
        if namespace.is_empty()
            || is_builtin_namespace(namespace)
            || namespace == LOCAL_NAMESPACE
            || namespace.starts_with(HOST_SCHEME)
        {
            return Err(CoreError::invalid_operation(format!(
                "cannot register {} in reserved namespace '{namespace}'",
                function.name().local
            )));
        }
        let key = (function.name().clone(), function.arity());
        debug!(function = %function.name().lexical(), arity = key.1, "registered native function");
        self.update_registry(|registry| {
            registry.functions.insert(key, Arc::new(function));
        });
        Ok(())
    }

    /// Applies a registration and invalidates every cached plan.
    fn update_registry(&self, update: impl FnOnce(&mut Registry)) {
        let mut registry = self.registry.write();
        update(&mut registry);
        registry.generation += 1;
        self.entries.clear();
    }
}

impl fmt::Debug for QueryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryPool")
            .field("cached", &self.entries.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
