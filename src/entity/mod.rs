pub mod events;
pub mod header;
pub mod validation;

pub use events::{DeletingEventArgs, EntityChange, EntityEvent, EntityEvents, SavingEventArgs};
pub use header::EntityHeader;
pub use validation::{ValidationError, ValidationErrors};

use crate::core::{EntityError, EntityId, EntityRecord, EntityType, Result, SaveMode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;

/// Contract implemented by every persisted record type.
///
/// Identity lives in the embedded [`EntityHeader`]; the remaining fields are
/// serialized with serde and handed to the data provider as an
/// [`EntityRecord`].
///
/// ```
/// use olive_entities::core::{EntityType, IdStrategy};
/// use olive_entities::entity::{Entity, EntityHeader, ValidationErrors};
/// use serde::{Deserialize, Serialize};
///
/// static PERSON: EntityType = EntityType::new("Person", "hr").id_strategy(IdStrategy::Int);
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Person {
///     #[serde(skip)]
///     header: EntityHeader,
///     name: String,
/// }
///
/// impl Entity for Person {
///     fn entity_type() -> &'static EntityType {
///         &PERSON
///     }
///     fn header(&self) -> &EntityHeader {
///         &self.header
///     }
///     fn header_mut(&mut self) -> &mut EntityHeader {
///         &mut self.header
///     }
///     fn validate(&self) -> Result<(), ValidationErrors> {
///         let mut errors = ValidationErrors::new();
///         errors.require(!self.name.is_empty(), "Name", "Name is required");
///         errors.into_result()
///     }
/// }
///
/// let person = Person { name: "Ann".into(), ..Default::default() };
/// assert!(person.is_new());
/// assert!(person.validate().is_ok());
/// ```
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn entity_type() -> &'static EntityType;

    fn header(&self) -> &EntityHeader;

    fn header_mut(&mut self) -> &mut EntityHeader;

    /// Checks business rules. Return every broken rule, not just the first.
    fn validate(&self) -> std::result::Result<(), ValidationErrors> {
        Ok(())
    }

    fn on_validating(&mut self) {}

    fn on_saving(&mut self, _args: &mut SavingEventArgs) {}

    fn on_saved(&mut self, _mode: SaveMode) {}

    fn on_deleting(&self, _args: &mut DeletingEventArgs) {}

    fn on_deleted(&self) {}

    fn id(&self) -> Option<&EntityId> {
        self.header().id()
    }

    fn is_new(&self) -> bool {
        self.header().is_new()
    }

    fn to_record(&self) -> Result<EntityRecord> {
        let header = self.header();
        let mut record = EntityRecord::new(
            Self::entity_type().name(),
            header.id().cloned(),
            serde_json::to_value(self)?,
        );
        record.row_version = header.row_version();
        record.is_new = header.is_new();
        Ok(record)
    }

    /// Materializes a loaded record as an immutable instance.
    fn from_record(record: EntityRecord) -> Result<Self> {
        let id = record.id.clone().ok_or_else(|| {
            EntityError::Provider(format!(
                "{} record returned by the provider has no identity",
                record.type_name
            ))
        })?;
        let mut entity: Self = serde_json::from_value(record.fields)?;
        entity.header_mut().set_loaded(id, record.row_version);
        Ok(entity)
    }
}

/// Object-safe view of an entity used where several entity types travel
/// together, such as bulk writes.
pub trait DynEntity: Send + Sync {
    fn descriptor(&self) -> &'static EntityType;

    fn entity_header(&self) -> &EntityHeader;

    fn entity_header_mut(&mut self) -> &mut EntityHeader;

    fn record(&self) -> Result<EntityRecord>;

    /// Runs the validating hook, the global validating handlers and `validate`.
    fn run_validation(&mut self, events: &EntityEvents) -> std::result::Result<(), ValidationErrors>;

    fn as_any(&self) -> &dyn Any;
}

impl<T: Entity> DynEntity for T {
    fn descriptor(&self) -> &'static EntityType {
        T::entity_type()
    }

    fn entity_header(&self) -> &EntityHeader {
        self.header()
    }

    fn entity_header_mut(&mut self) -> &mut EntityHeader {
        self.header_mut()
    }

    fn record(&self) -> Result<EntityRecord> {
        self.to_record()
    }

    fn run_validation(&mut self, events: &EntityEvents) -> std::result::Result<(), ValidationErrors> {
        self.on_validating();

        let mut errors = ValidationErrors::new();
        events.raise_validating(T::entity_type().name(), self.as_any(), &mut errors);
        if let Err(own) = self.validate() {
            errors.merge(own);
        }
        errors.into_result()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
