use super::{Database, finish_scope};
use crate::audit::ApplicationEvent;
use crate::core::{
    EntityError, EntityId, EntityType, IdStrategy, Result, SaveBehaviour, SaveMode, SaveOutcome,
};
use crate::entity::{DynEntity, Entity, EntityEvent, EntityHeader, SavingEventArgs};
use crate::transaction::ScopeOption;
use tracing::{debug, warn};

impl Database {
    pub async fn save<T: Entity>(&self, entity: &mut T) -> Result<SaveOutcome> {
        self.save_with(entity, SaveBehaviour::NONE).await
    }

    /// Inserts a new entity or updates a persisted one.
    ///
    /// Updates of the same identity are serialized through the keyed lock.
    /// With `Database:Save.Enforce.Transaction` on and no transaction bound,
    /// the write runs in its own transaction.
    pub async fn save_with<T: Entity>(&self, entity: &mut T, behaviour: SaveBehaviour) -> Result<SaveOutcome> {
        let entity_type = T::entity_type();
        self.check_save_preconditions(entity.header(), entity_type)?;

        let _guard = match entity.id() {
            Some(id) if !entity.is_new() => Some(self.locks().lock(&entity_type.lock_key(id)).await),
            _ => None,
        };

        if !self.must_wrap_in_transaction() {
            return self.run_save_pipeline(entity, behaviour).await;
        }

        let was_new = entity.is_new();
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let scoped = self.in_scope(&scope);
        let result = scoped.run_save_pipeline(entity, behaviour).await;
        let result = finish_scope(scope, result).await;

        if result.is_err() && was_new && !entity.is_new() {
            entity.header_mut().set_unsaved();
        }
        result
    }

    /// Saves every item in one transaction.
    pub async fn save_all<T: Entity>(&self, items: &mut [T]) -> Result<()> {
        let scope = self.create_transaction_scope(ScopeOption::Required).await?;
        let scoped = self.in_scope(&scope);
        let result = async {
            for item in items.iter_mut() {
                scoped.save(item).await?;
            }
            Ok::<_, EntityError>(())
        }
        .await;
        finish_scope(scope, result).await
    }

    fn check_save_preconditions(&self, header: &EntityHeader, entity_type: &EntityType) -> Result<()> {
        if header.is_immutable() {
            return Err(EntityError::ImmutableEntity(entity_type.to_string()));
        }

        if !header.is_new()
            && self.any_open_transaction()
            && (header.is_stale() || header.is_cloned_from_stale())
        {
            return Err(EntityError::StaleInstance(format!(
                "Database.save() was called on a stale instance of {} (ID {}). A newer clone of it was already \
                 saved in the current transaction, so saving this instance would overwrite those changes. \
                 Reload the instance with Database.reload() and apply the changes to the fresh copy.",
                entity_type,
                header.id().map(ToString::to_string).unwrap_or_default()
            )));
        }

        Ok(())
    }

    async fn run_save_pipeline<T: Entity>(&self, entity: &mut T, behaviour: SaveBehaviour) -> Result<SaveOutcome> {
        let entity_type = T::entity_type();
        let provider = self.providers().get_provider(entity_type)?;
        let mode = if entity.is_new() { SaveMode::Insert } else { SaveMode::Update };
        debug!(entity = %entity_type, id = ?entity.id(), mode = %mode, "saving entity");

        if behaviour.contains(SaveBehaviour::BYPASS_VALIDATION) {
            if !provider.support_validation_bypassing() {
                return Err(EntityError::Capability(format!(
                    "The data provider of {} does not support bypassing validation",
                    entity_type
                )));
            }
        } else {
            entity.run_validation(self.events())?;
        }

        if !behaviour.contains(SaveBehaviour::BYPASS_SAVING) {
            let mut args = SavingEventArgs::new(mode);
            entity.on_saving(&mut args);
            self.events().raise_saving(entity_type.name(), entity.as_any(), &mut args);

            if args.is_cancelled() {
                if let Some(id) = entity.id() {
                    self.cache().remove(entity_type.name(), id);
                }
                warn!(entity = %entity_type, id = ?entity.id(), "save cancelled by a saving handler");
                return Ok(SaveOutcome::Cancelled);
            }
        }

        if mode == SaveMode::Insert && entity.id().is_none() {
            match entity_type.strategy() {
                IdStrategy::Guid => entity.header_mut().set_id(EntityId::new_guid()),
                IdStrategy::Int => {}
                IdStrategy::Assigned => {
                    return Err(EntityError::InvalidOperation(format!(
                        "{} uses assigned IDs. Assign an ID before saving a new instance.",
                        entity_type
                    )));
                }
            }
        }

        let record = entity.to_record()?;

        if !behaviour.contains(SaveBehaviour::BYPASS_LOGGING) && !entity_type.is_audit_log() {
            if let Some(log) = self.event_log() {
                let event = match (&mode, record.id.as_ref()) {
                    (SaveMode::Update, Some(id)) => {
                        let stored = provider.get(id, self.open_transaction()).await?;
                        ApplicationEvent::updated(&record, stored.as_ref())
                    }
                    _ => ApplicationEvent::inserted(&record),
                };
                log.record(self, event).await?;
            }
        }

        let stored = provider.save(record, self.open_transaction()).await?;
        let id = stored.id.clone().ok_or_else(|| {
            EntityError::Provider(format!(
                "The data provider of {} returned a saved record without an ID",
                entity_type
            ))
        })?;
        self.record_row_version(entity_type.name(), &id, stored.row_version);
        entity.header_mut().set_row_version(stored.row_version);

        if mode == SaveMode::Update && entity.header().is_clone() && self.any_open_transaction() {
            entity.header().propagate_staleness();
        }

        if mode == SaveMode::Insert {
            entity.header_mut().set_saved(id.clone());
        }

        self.invalidate(entity_type.name(), &id);

        if !entity_type.is_audit_log() {
            self.events().raise_updated(&EntityEvent {
                type_name: entity_type.name(),
                id: Some(id.clone()),
                change: mode.into(),
            });
        }

        if !behaviour.contains(SaveBehaviour::BYPASS_SAVED) {
            entity.on_saved(mode);
            self.events().raise_saved(entity_type.name(), entity.as_any(), mode);
            self.cache().remove(entity_type.name(), &id);
        }

        debug!(entity = %entity_type, id = %id, row_version = stored.row_version, mode = %mode, "entity saved");
        Ok(SaveOutcome::Saved(mode))
    }
}
