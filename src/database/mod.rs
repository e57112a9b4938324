// ============================================================================
// Database
// ============================================================================
//
// Entry point of the save engine. A `Database` is a cheap handle over shared
// services (providers, keyed locks, transactions, cache, events, audit log)
// plus an optional transaction context. Binding a handle to a context is how
// work joins a transaction:
//
//     db.with_transaction(|tx_db| async move {
//         tx_db.save(&mut order).await?;
//         tx_db.save(&mut invoice).await
//     }).await?;
//
// ============================================================================

mod bulk;
mod delete;
mod query;
mod save;
mod update;

use crate::audit::ApplicationEventLog;
use crate::cache::{EntityCache, LruEntityCache};
use crate::config::DatabaseConfig;
use crate::core::{EntityId, EntityType, Result};
use crate::entity::EntityEvents;
use crate::lock::LockRegistry;
use crate::provider::ProviderRegistry;
use crate::transaction::{
    ScopeOption, TransactionBackend, TransactionContext, TransactionCoordinator, TransactionScope,
};
use std::future::Future;
use std::sync::Arc;
use tracing::info;

struct DatabaseInner {
    config: DatabaseConfig,
    providers: ProviderRegistry,
    locks: LockRegistry,
    transactions: TransactionCoordinator,
    cache: Arc<dyn EntityCache>,
    events: EntityEvents,
    event_log: Option<Arc<dyn ApplicationEventLog>>,
}

#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    transaction: Option<TransactionContext>,
}

/// Assembles a [`Database`] from configuration and optional replacements of
/// the default services.
pub struct DatabaseBuilder {
    config: DatabaseConfig,
    providers: Option<ProviderRegistry>,
    cache: Option<Arc<dyn EntityCache>>,
    event_log: Option<Arc<dyn ApplicationEventLog>>,
    backends: Vec<Arc<dyn TransactionBackend>>,
    types: Vec<&'static EntityType>,
}

impl DatabaseBuilder {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            providers: None,
            cache: None,
            event_log: None,
            backends: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Uses a registry prepared up front, e.g. with extra factory constructors.
    pub fn provider_registry(mut self, registry: ProviderRegistry) -> Self {
        self.providers = Some(registry);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn EntityCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn event_log(mut self, log: Arc<dyn ApplicationEventLog>) -> Self {
        self.event_log = Some(log);
        self
    }

    pub fn transaction_backend(mut self, backend: Arc<dyn TransactionBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    /// Makes a type known to polymorphic reads before it is first used.
    pub fn register_type(mut self, entity_type: &'static EntityType) -> Self {
        self.types.push(entity_type);
        self
    }

    pub fn build(self) -> Result<Database> {
        self.config.validate()?;

        let providers = self.providers.unwrap_or_default();
        providers.set_connection_strings(self.config.connection_strings.clone());
        for info in &self.config.providers {
            providers.register_data_provider_factory(info.clone())?;
        }
        for entity_type in self.types {
            providers.catalog().register_type(entity_type);
        }

        let transactions =
            TransactionCoordinator::new(self.config.isolation_level, &self.config.transaction_scope_type);
        for backend in self.backends {
            transactions.register_backend(backend);
        }

        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(LruEntityCache::new(self.config.cache_capacity)));

        info!(
            providers = self.config.providers.len(),
            enforce_save_transaction = self.config.enforce_save_transaction,
            isolation = %self.config.isolation_level,
            "database initialized"
        );

        Ok(Database {
            inner: Arc::new(DatabaseInner {
                config: self.config,
                providers,
                locks: LockRegistry::new(),
                transactions,
                cache,
                events: EntityEvents::new(),
                event_log: self.event_log,
            }),
            transaction: None,
        })
    }
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        DatabaseBuilder::new(config).build()
    }

    pub fn builder(config: DatabaseConfig) -> DatabaseBuilder {
        DatabaseBuilder::new(config)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.inner.config
    }

    pub fn providers(&self) -> &ProviderRegistry {
        &self.inner.providers
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.inner.locks
    }

    pub fn transactions(&self) -> &TransactionCoordinator {
        &self.inner.transactions
    }

    pub fn cache(&self) -> &Arc<dyn EntityCache> {
        &self.inner.cache
    }

    /// Global lifecycle handlers.
    pub fn events(&self) -> &EntityEvents {
        &self.inner.events
    }

    /// The context this handle is bound to, open or not.
    pub fn transaction(&self) -> Option<&TransactionContext> {
        self.transaction.as_ref()
    }

    pub fn any_open_transaction(&self) -> bool {
        self.open_transaction().is_some()
    }

    pub(crate) fn open_transaction(&self) -> Option<&TransactionContext> {
        self.transaction.as_ref().filter(|ctx| ctx.is_open())
    }

    /// A handle sharing the same services, bound to `context`.
    pub fn with_context(&self, context: TransactionContext) -> Database {
        Database {
            inner: Arc::clone(&self.inner),
            transaction: Some(context),
        }
    }

    pub fn in_scope(&self, scope: &TransactionScope) -> Database {
        self.with_context(scope.context().clone())
    }

    pub fn without_transaction(&self) -> Database {
        Database {
            inner: Arc::clone(&self.inner),
            transaction: None,
        }
    }

    /// Joins the bound transaction (`Required`) or starts a new root one.
    pub async fn create_transaction_scope(&self, option: ScopeOption) -> Result<TransactionScope> {
        self.inner
            .transactions
            .create_scope(self.open_transaction(), option)
            .await
    }

    /// Runs `op` with a handle bound to a transaction. Commits when `op`
    /// succeeds and the scope is the root; rolls back otherwise.
    pub async fn with_transaction<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce(Database) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let tx_db = self.in_scope(&scope);
        let result = op(tx_db).await;
        finish_scope(scope, result).await
    }

    /// Drops every cached record.
    pub fn refresh(&self) {
        self.inner.cache.clear();
    }

    pub(crate) fn must_wrap_in_transaction(&self) -> bool {
        self.inner.config.enforce_save_transaction && !self.any_open_transaction()
    }

    pub(crate) fn event_log(&self) -> Option<&Arc<dyn ApplicationEventLog>> {
        if self.inner.config.log_application_events {
            self.inner.event_log.as_ref()
        } else {
            None
        }
    }

    /// Removes a cached record now, and again when the bound transaction ends.
    pub(crate) fn invalidate(&self, type_name: &'static str, id: &EntityId) {
        self.inner.cache.remove(type_name, id);
        if let Some(ctx) = self.open_transaction() {
            let cache = Arc::clone(&self.inner.cache);
            let id = id.clone();
            ctx.on_completed(move |_| cache.remove(type_name, &id));
        }
    }

    pub(crate) fn invalidate_type(&self, type_name: &'static str) {
        self.inner.cache.remove_type(type_name);
        if let Some(ctx) = self.open_transaction() {
            let cache = Arc::clone(&self.inner.cache);
            ctx.on_completed(move |_| cache.remove_type(type_name));
        }
    }

    /// Raises the cache's row-version guard for a written row. Inside a
    /// transaction the guard only moves once the root commits.
    pub(crate) fn record_row_version(&self, type_name: &'static str, id: &EntityId, row_version: u64) {
        match self.open_transaction() {
            Some(ctx) => {
                let cache = Arc::clone(&self.inner.cache);
                let id = id.clone();
                ctx.on_committed(move || cache.update_row_version(type_name, &id, row_version));
            }
            None => self.inner.cache.update_row_version(type_name, id, row_version),
        }
    }
}

pub(crate) async fn finish_scope<T>(scope: TransactionScope, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            scope.complete().await?;
            Ok(value)
        }
        Err(err) => {
            scope.rollback();
            Err(err)
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("providers", &self.inner.providers)
            .field("transaction", &self.transaction)
            .finish_non_exhaustive()
    }
}
