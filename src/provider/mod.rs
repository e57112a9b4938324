// ============================================================================
// Data Providers
// ============================================================================
//
// A data provider performs the physical reads and writes of one entity type.
// Providers are obtained from factories registered per type or per module;
// the registry resolves and caches them.
//
// Every I/O method receives the transaction the caller is bound to, if any.
// Providers enlist their undo work on that context.
//
// ============================================================================

pub mod catalog;
pub mod info;
pub mod memory;
pub mod registry;

pub use catalog::TypeCatalog;
pub use info::{DataProviderFactoryInfo, FactoryTarget};
pub use memory::{MemoryDataAccess, MemoryDataProvider, MemoryProviderFactory, MemoryStore};
pub use registry::{FactoryConstructor, ProviderRegistry};

use crate::core::{AggregateFunction, EntityId, EntityRecord, EntityType, Query, Result};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Storage strategy for one entity type.
#[async_trait]
pub trait DataProvider: Send + Sync {
    fn entity_type(&self) -> &'static EntityType;

    fn connection_string(&self) -> &str;

    /// Whether saves may skip validation against this store.
    fn support_validation_bypassing(&self) -> bool {
        false
    }

    async fn get(&self, id: &EntityId, tx: Option<&TransactionContext>) -> Result<Option<EntityRecord>>;

    /// Inserts (`record.is_new`) or updates a record and returns the stored
    /// form with its identity and new row version.
    async fn save(&self, record: EntityRecord, tx: Option<&TransactionContext>) -> Result<EntityRecord>;

    async fn delete(&self, record: &EntityRecord, tx: Option<&TransactionContext>) -> Result<()>;

    async fn get_list(&self, query: &Query, tx: Option<&TransactionContext>) -> Result<Vec<EntityRecord>>;

    async fn count(&self, query: &Query, tx: Option<&TransactionContext>) -> Result<usize>;

    async fn aggregate(
        &self,
        query: &Query,
        function: AggregateFunction,
        property: &str,
        tx: Option<&TransactionContext>,
    ) -> Result<Option<JsonValue>>;

    /// Inserts `records` in batches of `batch_size`. Returns the stored
    /// records in input order.
    async fn bulk_insert(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>>;

    async fn bulk_update(
        &self,
        records: Vec<EntityRecord>,
        batch_size: usize,
        tx: Option<&TransactionContext>,
    ) -> Result<Vec<EntityRecord>>;
}

/// Raw, type-agnostic access to the store behind a factory.
#[async_trait]
pub trait DataAccess: Send + Sync {
    fn connection_string(&self) -> &str;

    async fn tables(&self) -> Vec<String>;

    async fn scan(&self, table: &str) -> Result<Vec<EntityRecord>>;

    /// Removes every record of a table and returns how many were removed.
    async fn truncate(&self, table: &str) -> Result<usize>;
}

pub trait DataProviderFactory: Send + Sync {
    fn info(&self) -> &DataProviderFactoryInfo;

    fn connection_string(&self) -> &str;

    /// Whether providers for abstract base types can read across tables.
    fn supports_polymorphism(&self) -> bool;

    fn get_provider(&self, entity_type: &'static EntityType) -> Result<Arc<dyn DataProvider>>;

    fn get_access(&self) -> Arc<dyn DataAccess>;
}
