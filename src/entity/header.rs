use crate::core::{EntityError, EntityId, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Shared state of one in-memory instance.
///
/// Clones link to their origin through a weak reference so that saving a
/// clone can mark the origin stale without keeping it alive.
#[derive(Debug, Default)]
pub(crate) struct InstanceState {
    stale: AtomicBool,
    /// Set once this clone's save made its origin stale.
    superseded_origin: AtomicBool,
    cloned_from: Option<Weak<InstanceState>>,
}

impl InstanceState {
    fn cloned_from(origin: &Arc<InstanceState>) -> Self {
        Self {
            stale: AtomicBool::new(false),
            superseded_origin: AtomicBool::new(false),
            cloned_from: Some(Arc::downgrade(origin)),
        }
    }

    fn origin(&self) -> Option<Arc<InstanceState>> {
        self.cloned_from.as_ref().and_then(Weak::upgrade)
    }
}

/// Identity and lifecycle bookkeeping embedded in every entity.
///
/// Embed it with `#[serde(skip)]`; the engine fills it in on save and load.
/// `Clone` yields a mutable copy with the same identity whose origin is
/// tracked for staleness detection.
#[derive(Debug)]
pub struct EntityHeader {
    id: Option<EntityId>,
    original_id: Option<EntityId>,
    is_new: bool,
    row_version: u64,
    immutable: bool,
    instance: Arc<InstanceState>,
}

impl Default for EntityHeader {
    fn default() -> Self {
        Self {
            id: None,
            original_id: None,
            is_new: true,
            row_version: 0,
            immutable: false,
            instance: Arc::new(InstanceState::default()),
        }
    }
}

impl Clone for EntityHeader {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            original_id: self.original_id.clone(),
            is_new: self.is_new,
            row_version: self.row_version,
            immutable: false,
            instance: Arc::new(InstanceState::cloned_from(&self.instance)),
        }
    }
}

impl EntityHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> Option<&EntityId> {
        self.id.as_ref()
    }

    /// Identity captured when the instance was loaded or first saved.
    pub fn original_id(&self) -> Option<&EntityId> {
        self.original_id.as_ref()
    }

    pub fn is_new(&self) -> bool {
        self.is_new
    }

    pub fn row_version(&self) -> u64 {
        self.row_version
    }

    /// Instances handed out by reads are immutable snapshots.
    pub fn is_immutable(&self) -> bool {
        self.immutable
    }

    /// True once a clone of this instance was saved inside an open transaction.
    pub fn is_stale(&self) -> bool {
        self.instance.stale.load(Ordering::Acquire)
    }

    /// True when this instance was cloned from an instance that another
    /// clone has since made stale.
    pub fn is_cloned_from_stale(&self) -> bool {
        !self.instance.superseded_origin.load(Ordering::Acquire)
            && self
                .instance
                .origin()
                .is_some_and(|origin| origin.stale.load(Ordering::Acquire))
    }

    pub fn is_clone(&self) -> bool {
        self.instance.cloned_from.is_some()
    }

    /// Assigns the identity of an entity whose type uses caller-assigned ids.
    pub fn assign_id(&mut self, id: impl Into<EntityId>) -> Result<()> {
        if !self.is_new {
            return Err(EntityError::InvalidOperation(
                "The identity of a saved entity cannot be changed".into(),
            ));
        }
        self.id = Some(id.into());
        Ok(())
    }

    pub(crate) fn set_id(&mut self, id: EntityId) {
        self.id = Some(id);
    }

    pub(crate) fn set_row_version(&mut self, row_version: u64) {
        self.row_version = row_version;
    }

    /// Fixes the identity after the first successful insert.
    pub(crate) fn set_saved(&mut self, id: EntityId) {
        self.original_id = Some(id.clone());
        self.id = Some(id);
        self.is_new = false;
    }

    /// Rolls an insert back to the unsaved state.
    pub(crate) fn set_unsaved(&mut self) {
        self.original_id = None;
        self.is_new = true;
    }

    /// Marks a freshly read, immutable snapshot.
    pub(crate) fn set_loaded(&mut self, id: EntityId, row_version: u64) {
        self.set_saved(id);
        self.row_version = row_version;
        self.immutable = true;
    }

    /// Marks the origin stale and this instance fresh. Returns false when the
    /// instance is not a clone or its origin is gone.
    pub(crate) fn propagate_staleness(&self) -> bool {
        self.instance.stale.store(false, Ordering::Release);
        match self.instance.origin() {
            Some(origin) => {
                origin.stale.store(true, Ordering::Release);
                self.instance.superseded_origin.store(true, Ordering::Release);
                true
            }
            None => false,
        }
    }
}
