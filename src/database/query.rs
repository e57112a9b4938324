use super::Database;
use crate::core::{AggregateFunction, EntityError, EntityId, EntityRecord, EntityType, Query, Result};
use crate::entity::Entity;
use futures::future::try_join_all;
use serde_json::Value as JsonValue;
use tracing::trace;

impl Database {
    /// Loads an immutable instance or fails with `NotFound`.
    pub async fn get<T: Entity>(&self, id: impl Into<EntityId>) -> Result<T> {
        let id = id.into();
        self.find(id.clone())
            .await?
            .ok_or_else(|| EntityError::NotFound(T::entity_type().to_string(), id.to_string()))
    }

    /// Loads an immutable instance.
    ///
    /// Outside a transaction the entity cache is consulted first and filled
    /// on a miss. Inside one the provider is always asked so the read sees
    /// the transaction's own writes.
    pub async fn find<T: Entity>(&self, id: impl Into<EntityId>) -> Result<Option<T>> {
        let id = id.into();
        let entity_type = T::entity_type();
        let in_transaction = self.any_open_transaction();

        if !in_transaction {
            if let Some(record) = self.cache().get(entity_type.name(), &id) {
                trace!(entity = %entity_type, id = %id, "cache hit");
                return T::from_record(record).map(Some);
            }
        }

        let provider = self.providers().get_provider(entity_type)?;
        let Some(record) = provider.get(&id, self.open_transaction()).await? else {
            return Ok(None);
        };

        if !in_transaction {
            self.cache().add(record.clone());
        }
        T::from_record(record).map(Some)
    }

    /// Reads `item` again from its provider, skipping the cache, and returns
    /// a fresh mutable instance that can be changed and saved.
    pub async fn reload<T: Entity>(&self, item: &T) -> Result<T> {
        let entity_type = T::entity_type();
        let id = match item.id() {
            Some(id) if !item.is_new() => id.clone(),
            _ => {
                return Err(EntityError::InvalidOperation(format!(
                    "Cannot reload a new {} instance that was never saved",
                    entity_type
                )));
            }
        };

        let provider = self.providers().get_provider(entity_type)?;
        let record = provider
            .get(&id, self.open_transaction())
            .await?
            .ok_or_else(|| EntityError::NotFound(entity_type.to_string(), id.to_string()))?;

        let mut fresh: T = serde_json::from_value(record.fields)?;
        fresh.header_mut().set_saved(id);
        fresh.header_mut().set_row_version(record.row_version);
        Ok(fresh)
    }

    pub async fn get_list<T: Entity>(&self, query: &Query) -> Result<Vec<T>> {
        let provider = self.providers().get_provider(T::entity_type())?;
        provider
            .get_list(query, self.open_transaction())
            .await?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    pub async fn count<T: Entity>(&self, query: &Query) -> Result<usize> {
        let provider = self.providers().get_provider(T::entity_type())?;
        provider.count(query, self.open_transaction()).await
    }

    /// Applies `function` to `property` over the records matching `query`.
    /// `None` when nothing matched.
    pub async fn aggregate<T: Entity>(
        &self,
        query: &Query,
        function: AggregateFunction,
        property: &str,
    ) -> Result<Option<JsonValue>> {
        let provider = self.providers().get_provider(T::entity_type())?;
        provider
            .aggregate(query, function, property, self.open_transaction())
            .await
    }

    /// Reads records of `base_type` and all of its subtypes from every
    /// provider that can serve them. Records come back per provider in
    /// resolution order; `query` is applied by each provider.
    pub async fn get_polymorphic(&self, base_type: &'static EntityType, query: &Query) -> Result<Vec<EntityRecord>> {
        let providers = self.providers().resolve_data_providers(base_type)?;
        let tx = self.open_transaction();
        let reads = providers.iter().map(|provider| provider.get_list(query, tx));
        let results = try_join_all(reads).await?;
        Ok(results.into_iter().flatten().collect())
    }
}
