use super::{Database, finish_scope};
use crate::audit::ApplicationEvent;
use crate::core::{DeleteBehaviour, EntityError, EntityId, Result};
use crate::entity::{DeletingEventArgs, DynEntity, Entity, EntityChange, EntityEvent};
use crate::transaction::ScopeOption;
use tracing::{debug, warn};

impl Database {
    /// Deletes a persisted entity. Returns `false` when a deleting handler
    /// cancelled the delete.
    pub async fn delete<T: Entity>(&self, item: &T) -> Result<bool> {
        self.delete_with(item, DeleteBehaviour::NONE).await
    }

    pub async fn delete_with<T: Entity>(&self, item: &T, behaviour: DeleteBehaviour) -> Result<bool> {
        let entity_type = T::entity_type();
        let id = match item.id() {
            Some(id) if !item.is_new() => id.clone(),
            _ => {
                return Err(EntityError::InvalidOperation(format!(
                    "Cannot delete a new {} instance that was never saved",
                    entity_type
                )));
            }
        };

        let _guard = self.locks().lock(&entity_type.lock_key(&id)).await;

        if !self.must_wrap_in_transaction() {
            return self.run_delete_pipeline(item, &id, behaviour).await;
        }

        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let scoped = self.in_scope(&scope);
        let result = scoped.run_delete_pipeline(item, &id, behaviour).await;
        finish_scope(scope, result).await
    }

    /// Deletes every item in one transaction. Returns how many were deleted.
    pub async fn delete_all<T: Entity>(&self, items: &[T]) -> Result<usize> {
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let scoped = self.in_scope(&scope);
        let result = async {
            let mut deleted = 0;
            for item in items {
                if scoped.delete(item).await? {
                    deleted += 1;
                }
            }
            Ok::<_, EntityError>(deleted)
        }
        .await;
        finish_scope(scope, result).await
    }

    async fn run_delete_pipeline<T: Entity>(&self, item: &T, id: &EntityId, behaviour: DeleteBehaviour) -> Result<bool> {
        let entity_type = T::entity_type();
        let provider = self.providers().get_provider(entity_type)?;

        if !behaviour.contains(DeleteBehaviour::BYPASS_DELETING) {
            let mut args = DeletingEventArgs::default();
            item.on_deleting(&mut args);
            self.events().raise_deleting(entity_type.name(), item.as_any(), &mut args);
            if args.is_cancelled() {
                warn!(entity = %entity_type, id = %id, "delete cancelled by a deleting handler");
                return Ok(false);
            }
        }

        let record = item.to_record()?;

        if !behaviour.contains(DeleteBehaviour::BYPASS_LOGGING) && !entity_type.is_audit_log() {
            if let Some(log) = self.event_log() {
                log.record(self, ApplicationEvent::deleted(&record)).await?;
            }
        }

        provider.delete(&record, self.open_transaction()).await?;
        self.invalidate(entity_type.name(), id);

        if !entity_type.is_audit_log() {
            self.events().raise_updated(&EntityEvent {
                type_name: entity_type.name(),
                id: Some(id.clone()),
                change: EntityChange::Deleted,
            });
        }

        if !behaviour.contains(DeleteBehaviour::BYPASS_DELETED) {
            item.on_deleted();
            self.events().raise_deleted(entity_type.name(), item.as_any());
            self.cache().remove(entity_type.name(), id);
        }

        debug!(entity = %entity_type, id = %id, "entity deleted");
        Ok(true)
    }
}
