// ============================================================================
// Entity Lifecycle Events
// ============================================================================
//
// Handlers are registered per entity type and stored type-erased; dispatch
// downcasts back to the concrete entity. Handler lists are copied out of the
// lock before invocation so a handler may register further handlers.
//
// ============================================================================

use super::{Entity, ValidationErrors};
use crate::core::{EntityId, SaveMode};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Arguments of the cancelable saving event.
#[derive(Debug, Clone)]
pub struct SavingEventArgs {
    pub mode: SaveMode,
    cancel: bool,
}

impl SavingEventArgs {
    pub fn new(mode: SaveMode) -> Self {
        Self { mode, cancel: false }
    }

    pub fn cancel(&mut self) {
        self.cancel = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
    }
}

/// Arguments of the cancelable deleting event.
#[derive(Debug, Clone, Default)]
pub struct DeletingEventArgs {
    cancel: bool,
}

impl DeletingEventArgs {
    pub fn cancel(&mut self) {
        self.cancel = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityChange {
    Inserted,
    Updated,
    Deleted,
}

impl From<SaveMode> for EntityChange {
    fn from(mode: SaveMode) -> Self {
        match mode {
            SaveMode::Insert => EntityChange::Inserted,
            SaveMode::Update => EntityChange::Updated,
        }
    }
}

/// Payload of the database-wide updated event.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityEvent {
    pub type_name: &'static str,
    pub id: Option<EntityId>,
    pub change: EntityChange,
}

type ValidatingHandler = Arc<dyn Fn(&dyn Any, &mut ValidationErrors) + Send + Sync>;
type SavingHandler = Arc<dyn Fn(&dyn Any, &mut SavingEventArgs) + Send + Sync>;
type SavedHandler = Arc<dyn Fn(&dyn Any, SaveMode) + Send + Sync>;
type DeletingHandler = Arc<dyn Fn(&dyn Any, &mut DeletingEventArgs) + Send + Sync>;
type DeletedHandler = Arc<dyn Fn(&dyn Any) + Send + Sync>;
type UpdatedHandler = Arc<dyn Fn(&EntityEvent) + Send + Sync>;

type HandlerMap<H> = RwLock<HashMap<&'static str, Vec<H>>>;

/// Registry of global lifecycle handlers.
#[derive(Default)]
pub struct EntityEvents {
    validating: HandlerMap<ValidatingHandler>,
    saving: HandlerMap<SavingHandler>,
    saved: HandlerMap<SavedHandler>,
    deleting: HandlerMap<DeletingHandler>,
    deleted: HandlerMap<DeletedHandler>,
    updated: RwLock<Vec<UpdatedHandler>>,
}

fn register<H>(map: &HandlerMap<H>, type_name: &'static str, handler: H) {
    map.write()
        .unwrap_or_else(PoisonError::into_inner)
        .entry(type_name)
        .or_default()
        .push(handler);
}

fn handlers<H: Clone>(map: &HandlerMap<H>, type_name: &str) -> Vec<H> {
    map.read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(type_name)
        .cloned()
        .unwrap_or_default()
}

impl EntityEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds rules evaluated before the entity's own `validate`.
    pub fn on_validating<T, F>(&self, handler: F)
    where
        T: Entity,
        F: Fn(&T, &mut ValidationErrors) + Send + Sync + 'static,
    {
        let erased: ValidatingHandler = Arc::new(move |entity, errors| {
            if let Some(entity) = entity.downcast_ref::<T>() {
                handler(entity, errors);
            }
        });
        register(&self.validating, T::entity_type().name(), erased);
    }

    pub fn on_saving<T, F>(&self, handler: F)
    where
        T: Entity,
        F: Fn(&T, &mut SavingEventArgs) + Send + Sync + 'static,
    {
        let erased: SavingHandler = Arc::new(move |entity, args| {
            if let Some(entity) = entity.downcast_ref::<T>() {
                handler(entity, args);
            }
        });
        register(&self.saving, T::entity_type().name(), erased);
    }

    pub fn on_saved<T, F>(&self, handler: F)
    where
        T: Entity,
        F: Fn(&T, SaveMode) + Send + Sync + 'static,
    {
        let erased: SavedHandler = Arc::new(move |entity, mode| {
            if let Some(entity) = entity.downcast_ref::<T>() {
                handler(entity, mode);
            }
        });
        register(&self.saved, T::entity_type().name(), erased);
    }

    pub fn on_deleting<T, F>(&self, handler: F)
    where
        T: Entity,
        F: Fn(&T, &mut DeletingEventArgs) + Send + Sync + 'static,
    {
        let erased: DeletingHandler = Arc::new(move |entity, args| {
            if let Some(entity) = entity.downcast_ref::<T>() {
                handler(entity, args);
            }
        });
        register(&self.deleting, T::entity_type().name(), erased);
    }

    pub fn on_deleted<T, F>(&self, handler: F)
    where
        T: Entity,
        F: Fn(&T) + Send + Sync + 'static,
    {
        let erased: DeletedHandler = Arc::new(move |entity| {
            if let Some(entity) = entity.downcast_ref::<T>() {
                handler(entity);
            }
        });
        register(&self.deleted, T::entity_type().name(), erased);
    }

    /// Subscribes to every insert, update and delete of any entity type.
    pub fn on_updated<F>(&self, handler: F)
    where
        F: Fn(&EntityEvent) + Send + Sync + 'static,
    {
        self.updated
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(handler));
    }

    pub(crate) fn raise_validating(&self, type_name: &str, entity: &dyn Any, errors: &mut ValidationErrors) {
        for handler in handlers(&self.validating, type_name) {
            handler(entity, errors);
        }
    }

    pub(crate) fn raise_saving(&self, type_name: &str, entity: &dyn Any, args: &mut SavingEventArgs) {
        for handler in handlers(&self.saving, type_name) {
            handler(entity, args);
        }
    }

    pub(crate) fn raise_saved(&self, type_name: &str, entity: &dyn Any, mode: SaveMode) {
        for handler in handlers(&self.saved, type_name) {
            handler(entity, mode);
        }
    }

    pub(crate) fn raise_deleting(&self, type_name: &str, entity: &dyn Any, args: &mut DeletingEventArgs) {
        for handler in handlers(&self.deleting, type_name) {
            handler(entity, args);
        }
    }

    pub(crate) fn raise_deleted(&self, type_name: &str, entity: &dyn Any) {
        for handler in handlers(&self.deleted, type_name) {
            handler(entity);
        }
    }

    pub(crate) fn raise_updated(&self, event: &EntityEvent) {
        let subscribers = self
            .updated
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in subscribers {
            handler(event);
        }
    }
}

impl std::fmt::Debug for EntityEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityEvents").finish_non_exhaustive()
    }
}
