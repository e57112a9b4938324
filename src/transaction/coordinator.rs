// ============================================================================
// Transaction Coordinator
// ============================================================================
//
// Creates or joins transaction scopes and tracks every open root
// transaction in the process. Backends are looked up by the configured scope
// type name; "default" is always available.
//
// ============================================================================

use super::{
    DefaultTransactionBackend, IsolationLevel, ScopeOption, TransactionBackend, TransactionContext,
    TransactionId, TransactionScope,
};
use crate::config::DEFAULT_SCOPE_TYPE;
use crate::core::{EntityError, Result};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;
use tracing::{debug, info};

/// Snapshot of one open transaction.
#[derive(Debug, Clone)]
pub struct TransactionInfo {
    pub id: TransactionId,
    pub isolation_level: IsolationLevel,
    pub scope_type: String,
    pub started: Instant,
}

pub struct TransactionCoordinator {
    backends: RwLock<HashMap<String, Arc<dyn TransactionBackend>>>,

    // Removed by a completion hook when the transaction ends.
    open: Arc<RwLock<HashMap<TransactionId, TransactionInfo>>>,

    default_isolation: IsolationLevel,
    default_scope_type: String,
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new(IsolationLevel::default(), DEFAULT_SCOPE_TYPE)
    }
}

impl TransactionCoordinator {
    pub fn new(default_isolation: IsolationLevel, default_scope_type: &str) -> Self {
        let mut backends: HashMap<String, Arc<dyn TransactionBackend>> = HashMap::new();
        backends.insert(DEFAULT_SCOPE_TYPE.to_string(), Arc::new(DefaultTransactionBackend));

        Self {
            backends: RwLock::new(backends),
            open: Arc::new(RwLock::new(HashMap::new())),
            default_isolation,
            default_scope_type: default_scope_type.to_string(),
        }
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    pub fn default_scope_type(&self) -> &str {
        &self.default_scope_type
    }

    /// Registers a scope implementation under its name, replacing any
    /// backend registered under the same name.
    pub fn register_backend(&self, backend: Arc<dyn TransactionBackend>) {
        let name = backend.name().to_string();
        info!(scope_type = %name, "registered transaction backend");
        self.backends
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, backend);
    }

    fn backend(&self, scope_type: &str) -> Result<Arc<dyn TransactionBackend>> {
        self.backends
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope_type)
            .cloned()
            .ok_or_else(|| {
                EntityError::Configuration(format!(
                    "Transaction scope type '{}' is not registered",
                    scope_type
                ))
            })
    }

    /// Creates a scope with the configured isolation level and scope type.
    pub async fn create_scope(
        &self,
        current: Option<&TransactionContext>,
        option: ScopeOption,
    ) -> Result<TransactionScope> {
        let scope_type = self.default_scope_type.clone();
        self.create_scope_with(current, option, self.default_isolation, &scope_type)
            .await
    }

    pub async fn create_scope_with(
        &self,
        current: Option<&TransactionContext>,
        option: ScopeOption,
        isolation_level: IsolationLevel,
        scope_type: &str,
    ) -> Result<TransactionScope> {
        if option == ScopeOption::Required {
            if let Some(context) = current.filter(|ctx| ctx.is_open()) {
                debug!(transaction = %context.id(), "joining open transaction");
                return Ok(TransactionScope::joined(context.clone()));
            }
        }

        let backend = self.backend(scope_type)?;
        let context = TransactionContext::new(isolation_level, backend.clone());
        backend.begin(&context).await?;

        let id = context.id();
        self.open.write().unwrap_or_else(PoisonError::into_inner).insert(
            id,
            TransactionInfo {
                id,
                isolation_level,
                scope_type: scope_type.to_string(),
                started: Instant::now(),
            },
        );

        let open = Arc::clone(&self.open);
        context.on_completed(move |_| {
            open.write().unwrap_or_else(PoisonError::into_inner).remove(&id);
        });

        info!(transaction = %id, isolation = %isolation_level, scope_type, "transaction started");
        Ok(TransactionScope::root(context))
    }

    /// Number of root transactions that have not committed or rolled back.
    pub fn open_transactions(&self) -> usize {
        self.open.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn transaction_info(&self, id: TransactionId) -> Option<TransactionInfo> {
        self.open
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

impl std::fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("default_isolation", &self.default_isolation)
            .field("default_scope_type", &self.default_scope_type)
            .field("open_transactions", &self.open_transactions())
            .finish()
    }
}
