// ============================================================================
// Transaction Context
// ============================================================================
//
// The context is passed explicitly through the call chain instead of living
// in ambient task-local state. Everything that must happen when the
// transaction ends is enlisted here:
//
// - rollback actions   (providers undoing their writes, run newest first)
// - committed hooks    (root scope completion, commit only)
// - completed hooks    (commit or rollback, receives the outcome)
//
// ============================================================================

use super::{IsolationLevel, TransactionBackend, TransactionId, TransactionOutcome, TransactionState};
use crate::core::{EntityError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info};

type RollbackAction = Box<dyn FnOnce() + Send>;
type CommittedHook = Box<dyn FnOnce() + Send>;
type CompletedHook = Box<dyn FnOnce(TransactionOutcome) + Send>;

struct ContextInner {
    id: TransactionId,
    isolation_level: IsolationLevel,
    backend: Arc<dyn TransactionBackend>,
    state: Mutex<TransactionState>,
    doomed: AtomicBool,
    rollback_actions: Mutex<Vec<RollbackAction>>,
    committed_hooks: Mutex<Vec<CommittedHook>>,
    completed_hooks: Mutex<Vec<CompletedHook>>,
    started: Instant,
}

/// Handle to one open transaction. Cloning shares the same transaction.
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<ContextInner>,
}

impl TransactionContext {
    pub(crate) fn new(isolation_level: IsolationLevel, backend: Arc<dyn TransactionBackend>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                id: TransactionId::new(),
                isolation_level,
                backend,
                state: Mutex::new(TransactionState::Active),
                doomed: AtomicBool::new(false),
                rollback_actions: Mutex::new(Vec::new()),
                committed_hooks: Mutex::new(Vec::new()),
                completed_hooks: Mutex::new(Vec::new()),
                started: Instant::now(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.inner.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.inner.isolation_level
    }

    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    pub fn state(&self) -> TransactionState {
        *self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.state().is_active()
    }

    /// A nested scope was abandoned; the root scope can only roll back.
    pub fn is_doomed(&self) -> bool {
        self.inner.doomed.load(Ordering::Acquire)
    }

    pub fn duration(&self) -> Duration {
        self.inner.started.elapsed()
    }

    pub fn same_transaction(&self, other: &TransactionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Registers an undo step. Runs only if the transaction rolls back.
    pub fn on_rollback(&self, action: impl FnOnce() + Send + 'static) {
        if self.is_open() {
            self.inner
                .rollback_actions
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Box::new(action));
        }
    }

    /// Registers a hook that runs once the root scope commits.
    pub fn on_committed(&self, hook: impl FnOnce() + Send + 'static) {
        match self.state() {
            TransactionState::Active => self
                .inner
                .committed_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Box::new(hook)),
            TransactionState::Committed => hook(),
            TransactionState::Aborted => {}
        }
    }

    /// Registers a hook that runs when the transaction ends either way.
    pub fn on_completed(&self, hook: impl FnOnce(TransactionOutcome) + Send + 'static) {
        match self.state() {
            TransactionState::Active => self
                .inner
                .completed_hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(Box::new(hook)),
            TransactionState::Committed => hook(TransactionOutcome::Committed),
            TransactionState::Aborted => hook(TransactionOutcome::RolledBack),
        }
    }

    pub(crate) fn doom(&self) {
        self.inner.doomed.store(true, Ordering::Release);
    }

    pub(crate) async fn commit(&self) -> Result<()> {
        if self.is_doomed() {
            self.rollback();
            return Err(EntityError::Transaction(format!(
                "Transaction {} was aborted by a nested scope that did not complete",
                self.id()
            )));
        }

        let state = self.state();
        if !state.is_active() {
            return Err(EntityError::Transaction(format!(
                "Cannot commit: transaction {} is already {}",
                self.id(),
                state
            )));
        }

        if let Err(err) = self.inner.backend.commit(self).await {
            self.rollback();
            return Err(err);
        }

        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.is_active() {
                return Err(EntityError::Transaction(format!(
                    "Transaction {} ended while committing",
                    self.id()
                )));
            }
            *state = TransactionState::Committed;
        }

        self.take_rollback_actions();
        let committed = std::mem::take(
            &mut *self.inner.committed_hooks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for hook in committed {
            hook();
        }
        self.run_completed(TransactionOutcome::Committed);

        info!(transaction = %self.id(), elapsed_ms = self.duration().as_millis() as u64, "transaction committed");
        Ok(())
    }

    /// Rolls back an open transaction. No-op once it has ended.
    pub(crate) fn rollback(&self) {
        {
            let mut state = self.inner.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.is_active() {
                return;
            }
            *state = TransactionState::Aborted;
        }

        self.inner.backend.rollback(self);

        let mut actions = self.take_rollback_actions();
        debug!(transaction = %self.id(), undo_steps = actions.len(), "rolling back transaction");
        while let Some(action) = actions.pop() {
            action();
        }

        self.inner
            .committed_hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.run_completed(TransactionOutcome::RolledBack);

        info!(transaction = %self.id(), "transaction rolled back");
    }

    fn take_rollback_actions(&self) -> Vec<RollbackAction> {
        std::mem::take(&mut *self.inner.rollback_actions.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn run_completed(&self, outcome: TransactionOutcome) {
        let hooks = std::mem::take(
            &mut *self.inner.completed_hooks.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook(outcome);
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("id", &self.id())
            .field("isolation_level", &self.isolation_level())
            .field("state", &self.state())
            .field("doomed", &self.is_doomed())
            .finish()
    }
}
