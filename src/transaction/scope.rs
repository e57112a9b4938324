use super::TransactionContext;
use crate::core::Result;
use async_trait::async_trait;
use tracing::{debug, warn};

/// How a new scope relates to a transaction that is already open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeOption {
    /// Join the open transaction, or start one when none is open.
    #[default]
    Required,
    /// Always start a new root transaction.
    RequiresNew,
}

/// Pluggable transaction scope implementation.
///
/// A backend is notified when a root transaction begins and ends. Providers
/// that talk to a real store register their own backend and look it up by
/// name from the configured scope type.
#[async_trait]
pub trait TransactionBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn begin(&self, _context: &TransactionContext) -> Result<()> {
        Ok(())
    }

    async fn commit(&self, _context: &TransactionContext) -> Result<()> {
        Ok(())
    }

    /// Rollback is synchronous so that it can run from `Drop`.
    fn rollback(&self, _context: &TransactionContext) {}
}

/// Backend whose transactions live entirely in the enlisted undo actions.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTransactionBackend;

#[async_trait]
impl TransactionBackend for DefaultTransactionBackend {
    fn name(&self) -> &str {
        crate::config::DEFAULT_SCOPE_TYPE
    }
}

/// A unit of work bound to a [`TransactionContext`].
///
/// The root scope commits on [`complete`](Self::complete). A scope dropped
/// without completing rolls the transaction back; a nested scope dooms it so
/// that the root cannot commit.
#[must_use = "a scope that is dropped without `complete()` rolls back"]
pub struct TransactionScope {
    context: TransactionContext,
    is_root: bool,
    finished: bool,
}

impl TransactionScope {
    pub(crate) fn root(context: TransactionContext) -> Self {
        Self {
            context,
            is_root: true,
            finished: false,
        }
    }

    pub(crate) fn joined(context: TransactionContext) -> Self {
        Self {
            context,
            is_root: false,
            finished: false,
        }
    }

    pub fn context(&self) -> &TransactionContext {
        &self.context
    }

    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Marks the scope's work as done. Only the root scope commits.
    pub async fn complete(mut self) -> Result<()> {
        self.finished = true;
        if self.is_root {
            self.context.commit().await
        } else {
            debug!(transaction = %self.context.id(), "nested scope completed");
            Ok(())
        }
    }

    /// Abandons the scope's work.
    pub fn rollback(mut self) {
        self.finished = true;
        self.abandon();
    }

    fn abandon(&self) {
        if self.is_root {
            self.context.rollback();
        } else {
            self.context.doom();
        }
    }
}

impl Drop for TransactionScope {
    fn drop(&mut self) {
        if !self.finished {
            warn!(transaction = %self.context.id(), root = self.is_root, "scope dropped without completing");
            self.abandon();
        }
    }
}

impl std::fmt::Debug for TransactionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionScope")
            .field("context", &self.context)
            .field("is_root", &self.is_root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::{IsolationLevel, TransactionState};
    use std::sync::Arc;

    fn context() -> TransactionContext {
        TransactionContext::new(IsolationLevel::Serializable, Arc::new(DefaultTransactionBackend))
    }

    #[tokio::test]
    async fn test_root_scope_commits_on_complete() {
        let ctx = context();
        let scope = TransactionScope::root(ctx.clone());
        scope.complete().await.unwrap();
        assert_eq!(ctx.state(), TransactionState::Committed);
    }

    #[test]
    fn test_dropped_root_scope_rolls_back() {
        let ctx = context();
        {
            let _scope = TransactionScope::root(ctx.clone());
        }
        assert_eq!(ctx.state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn test_abandoned_nested_scope_dooms_root() {
        let ctx = context();
        let root = TransactionScope::root(ctx.clone());
        {
            let _nested = TransactionScope::joined(ctx.clone());
        }
        assert!(ctx.is_open());
        assert!(ctx.is_doomed());
        assert!(root.complete().await.is_err());
        assert_eq!(ctx.state(), TransactionState::Aborted);
    }

    #[tokio::test]
    async fn test_completed_nested_scope_leaves_root_open() {
        let ctx = context();
        let root = TransactionScope::root(ctx.clone());
        TransactionScope::joined(ctx.clone()).complete().await.unwrap();
        assert!(ctx.is_open());
        root.complete().await.unwrap();
        assert_eq!(ctx.state(), TransactionState::Committed);
    }
}
