//! Fault injection wrapper for exercising journal write failures.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared switches controlling a [`FaultyBackend`].
///
/// The injector is cloned into the backend, so a test can keep one handle and
/// flip faults on while the database owns the backend.
#[derive(Debug, Default, Clone)]
pub struct FaultInjector {
    state: Arc<FaultState>,
}

#[derive(Debug)]
struct FaultState {
    fail_flush: AtomicBool,
    fail_append: AtomicBool,
    append_budget: AtomicUsize,
    faults_raised: AtomicUsize,
}

impl Default for FaultState {
    fn default() -> Self {
        Self {
            fail_flush: AtomicBool::new(false),
            fail_append: AtomicBool::new(false),
            append_budget: AtomicUsize::new(usize::MAX),
            faults_raised: AtomicUsize::new(0),
        }
    }
}

impl FaultInjector {
    /// Creates an injector with every fault switched off.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every `flush` and `sync` fail until cleared.
    pub fn fail_flushes(&self, fail: bool) {
        self.state.fail_flush.store(fail, Ordering::SeqCst);
    }

    /// Makes every `append` fail until cleared.
    pub fn fail_appends(&self, fail: bool) {
        self.state.fail_append.store(fail, Ordering::SeqCst);
    }

    /// Allows `bytes` more bytes to be appended; the append that crosses the
    /// budget writes its prefix and then fails, leaving a torn tail.
    pub fn tear_after(&self, bytes: usize) {
        self.state.append_budget.store(bytes, Ordering::SeqCst);
    }

    /// Switches every fault off.
    pub fn reset(&self) {
        self.fail_flushes(false);
        self.fail_appends(false);
        self.state.append_budget.store(usize::MAX, Ordering::SeqCst);
    }

    /// Returns how many operations have failed because of an injected fault.
    #[must_use]
    pub fn faults_raised(&self) -> usize {
        self.state.faults_raised.load(Ordering::SeqCst)
    }

    fn raise(&self, what: &'static str) -> StorageError {
        self.state.faults_raised.fetch_add(1, Ordering::SeqCst);
        StorageError::Injected(what)
    }
}

/// A backend wrapper that fails operations when its [`FaultInjector`] says so.
pub struct FaultyBackend<B> {
    inner: B,
    faults: FaultInjector,
}

impl<B: StorageBackend> FaultyBackend<B> {
    /// Wraps `inner`, controlled by `faults`.
    pub fn new(inner: B, faults: FaultInjector) -> Self {
        Self { inner, faults }
    }

    /// Returns the injector controlling this backend.
    #[must_use]
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }
}

impl<B: StorageBackend> StorageBackend for FaultyBackend<B> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let state = &self.faults.state;
        if state.fail_append.load(Ordering::SeqCst) {
            return Err(self.faults.raise("append"));
        }

        let budget = state.append_budget.load(Ordering::SeqCst);
        if data.len() > budget {
            if budget > 0 {
                self.inner.append(&data[..budget])?;
            }
            state.append_budget.store(0, Ordering::SeqCst);
            return Err(self.faults.raise("torn append"));
        }
        if budget != usize::MAX {
            state.append_budget.store(budget - data.len(), Ordering::SeqCst);
        }

        self.inner.append(data)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.faults.state.fail_flush.load(Ordering::SeqCst) {
            return Err(self.faults.raise("flush"));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        if self.faults.state.fail_flush.load(Ordering::SeqCst) {
            return Err(self.faults.raise("sync"));
        }
        self.inner.sync()
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        self.inner.truncate(new_size)
    }
}
