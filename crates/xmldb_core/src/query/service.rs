//! Per-broker entry point for running queries.

use super::compile::CompiledQuery;
use super::context::{DynamicContext, StaticContext};
use super::item::Sequence;
use crate::error::CoreResult;
use crate::pool::Broker;
use crate::transaction::Transaction;
use std::sync::Arc;

/// Compiles and runs queries through a broker.
///
/// Queries read the committed state, or a transaction's own view including
/// its uncommitted writes when one is given. Plans come from the pool's
/// shared [`QueryPool`](super::QueryPool).
#[derive(Debug, Clone, Copy)]
pub struct QueryService<'b> {
    broker: &'b Broker,
}

impl<'b> QueryService<'b> {
    pub(crate) fn new(broker: &'b Broker) -> Self {
        Self { broker }
    }

    /// Returns a static context configured from the pool's settings.
    ///
    /// # Errors
    ///
    /// `PoolClosed` if the broker's pool is shutting down.
    pub fn static_context(&self, txn: Option<&Transaction>) -> CoreResult<StaticContext> {
        self.broker.ensure_usable()?;
        let config = self.broker.pool().config();
        Ok(StaticContext::new(self.broker.view(txn))
            .host_bindings(config.host_bindings_enabled)
            .max_call_depth(config.max_call_depth))
    }

    /// Returns an empty dynamic context over the committed state or `txn`.
    ///
    /// # Errors
    ///
    /// `PoolClosed` if the broker's pool is shutting down.
    pub fn dynamic_context(&self, txn: Option<&Transaction>) -> CoreResult<DynamicContext> {
        self.broker.ensure_usable()?;
        Ok(DynamicContext::new(self.broker.view(txn)))
    }

    /// Compiles `source` against the committed state.
    ///
    /// # Errors
    ///
    /// See [`QueryPool::compile`](super::QueryPool::compile).
    pub fn compile(&self, source: &str) -> CoreResult<Arc<CompiledQuery>> {
        let context = self.static_context(None)?;
        self.broker.pool().queries().compile(&context, source)
    }

    /// Compiles `source`; module-level variables see `txn`'s writes.
    ///
    /// # Errors
    ///
    /// See [`QueryPool::compile`](super::QueryPool::compile).
    pub fn compile_in(&self, txn: &Transaction, source: &str) -> CoreResult<Arc<CompiledQuery>> {
        let context = self.static_context(Some(txn))?;
        self.broker.pool().queries().compile(&context, source)
    }

    /// Executes a compiled plan.
    ///
    /// # Errors
    ///
    /// See [`QueryPool::execute`](super::QueryPool::execute).
    pub fn execute(&self, plan: &CompiledQuery, context: &DynamicContext) -> CoreResult<Sequence> {
        self.broker.ensure_usable()?;
        self.broker.pool().queries().execute(plan, context)
    }

    /// Compiles and runs `source` against the committed state.
    ///
    /// # Errors
    ///
    /// Any compilation or evaluation error.
    pub fn query(&self, source: &str) -> CoreResult<Sequence> {
        let plan = self.compile(source)?;
        let context = self.dynamic_context(None)?;
        self.execute(&plan, &context)
    }

    /// Compiles and runs `source` inside `txn`, seeing its uncommitted
    /// writes.
    ///
    /// # Errors
    ///
    /// Any compilation or evaluation error.
    pub fn query_in(&self, txn: &Transaction, source: &str) -> CoreResult<Sequence> {
        let plan = self.compile_in(txn, source)?;
        let context = self.dynamic_context(Some(txn))?;
        self.execute(&plan, &context)
    }
}
