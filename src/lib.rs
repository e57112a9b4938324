// ============================================================================
// Olive Entities Library
// ============================================================================
//
// Entity save engine: providers resolved per type or module, per-identity
// async locking, explicit transaction scopes, cache invalidation and
// batched bulk writes.
//
// ============================================================================

pub mod audit;
pub mod cache;
pub mod config;
pub mod core;
pub mod database;
pub mod entity;
pub mod lock;
pub mod provider;
pub mod transaction;

// Re-export main types for convenience
pub use audit::{ApplicationEvent, ApplicationEventLog, MemoryEventLog, PersistentEventLog};
pub use cache::{EntityCache, LruEntityCache};
pub use config::DatabaseConfig;
pub use core::{
    AggregateFunction, Criterion, DeleteBehaviour, EntityError, EntityId, EntityRecord, EntityType, IdStrategy,
    Operator, Query, Result, SaveBehaviour, SaveMode, SaveOutcome,
};
pub use database::{Database, DatabaseBuilder};
pub use entity::{DynEntity, Entity, EntityHeader, ValidationErrors};
pub use lock::LockRegistry;
pub use provider::{
    DataAccess, DataProvider, DataProviderFactory, DataProviderFactoryInfo, ProviderRegistry, TypeCatalog,
};
pub use transaction::{IsolationLevel, ScopeOption, TransactionContext, TransactionScope};
