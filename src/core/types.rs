use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identity of a persisted entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Guid(Uuid),
    Text(String),
}

impl EntityId {
    pub fn new_guid() -> Self {
        EntityId::Guid(Uuid::new_v4())
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            EntityId::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(v) => write!(f, "{}", v),
            EntityId::Guid(v) => write!(f, "{}", v),
            EntityId::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for EntityId {
    fn from(value: i64) -> Self {
        EntityId::Int(value)
    }
}

impl From<Uuid> for EntityId {
    fn from(value: Uuid) -> Self {
        EntityId::Guid(value)
    }
}

impl From<&str> for EntityId {
    fn from(value: &str) -> Self {
        EntityId::Text(value.to_string())
    }
}

impl From<String> for EntityId {
    fn from(value: String) -> Self {
        EntityId::Text(value)
    }
}

/// How a new entity receives its identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdStrategy {
    /// A random GUID assigned by the engine right before the first write.
    Guid,
    /// An integer assigned by the provider on insert.
    Int,
    /// The caller assigns the identity before saving.
    Assigned,
}

/// Static descriptor of an entity type.
///
/// Descriptors are `const`-constructible so each entity can expose a
/// `static` instance:
///
/// ```
/// use olive_entities::core::{EntityType, IdStrategy};
///
/// static PERSON: EntityType = EntityType::new("Person", "hr")
///     .with_bases(&["Contact"])
///     .id_strategy(IdStrategy::Int);
///
/// assert!(PERSON.is_subtype_of("Contact"));
/// ```
#[derive(Debug)]
pub struct EntityType {
    name: &'static str,
    module: &'static str,
    bases: &'static [&'static str],
    id_strategy: IdStrategy,
    is_abstract: bool,
    audit_log: bool,
}

impl EntityType {
    pub const fn new(name: &'static str, module: &'static str) -> Self {
        Self {
            name,
            module,
            bases: &[],
            id_strategy: IdStrategy::Guid,
            is_abstract: false,
            audit_log: false,
        }
    }

    /// Names of the interfaces and abstract bases this type satisfies.
    pub const fn with_bases(mut self, bases: &'static [&'static str]) -> Self {
        self.bases = bases;
        self
    }

    pub const fn id_strategy(mut self, strategy: IdStrategy) -> Self {
        self.id_strategy = strategy;
        self
    }

    /// Marks an interface or abstract base. Abstract types have no storage of
    /// their own and are only used for polymorphic resolution.
    pub const fn abstract_type(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Marks the application-event log type. Saves of these entities are
    /// never logged and never raise the global updated event.
    pub const fn audit_log(mut self) -> Self {
        self.audit_log = true;
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn module(&self) -> &'static str {
        self.module
    }

    pub fn bases(&self) -> &'static [&'static str] {
        self.bases
    }

    pub fn strategy(&self) -> IdStrategy {
        self.id_strategy
    }

    pub fn is_abstract(&self) -> bool {
        self.is_abstract
    }

    pub fn is_audit_log(&self) -> bool {
        self.audit_log
    }

    pub fn is_subtype_of(&self, base: &str) -> bool {
        self.name == base || self.bases.contains(&base)
    }

    /// Key used by the keyed lock registry for one identity of this type.
    /// Type names never contain `#`, so the id cannot run into the name.
    pub fn lock_key(&self, id: &EntityId) -> String {
        format!("{}.{}#{}", self.module, self.name, id)
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.module == other.module
    }
}

impl Eq for EntityType {}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.module, self.name)
    }
}

/// Whether a save inserted a new record or updated an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaveMode {
    Insert,
    Update,
}

impl fmt::Display for SaveMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveMode::Insert => write!(f, "Insert"),
            SaveMode::Update => write!(f, "Update"),
        }
    }
}

bitflags! {
    /// Pipeline stages a save may skip.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct SaveBehaviour: u8 {
        const BYPASS_VALIDATION = 1 << 0;
        const BYPASS_SAVING     = 1 << 1;
        const BYPASS_LOGGING    = 1 << 2;
        const BYPASS_SAVED      = 1 << 3;
        const BYPASS_ALL = Self::BYPASS_VALIDATION.bits()
            | Self::BYPASS_SAVING.bits()
            | Self::BYPASS_LOGGING.bits()
            | Self::BYPASS_SAVED.bits();
    }
}

impl SaveBehaviour {
    pub const NONE: SaveBehaviour = SaveBehaviour::empty();
}

bitflags! {
    /// Pipeline stages a delete may skip.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DeleteBehaviour: u8 {
        const BYPASS_DELETING = 1 << 0;
        const BYPASS_DELETED  = 1 << 1;
        const BYPASS_LOGGING  = 1 << 2;
        const BYPASS_ALL = Self::BYPASS_DELETING.bits()
            | Self::BYPASS_DELETED.bits()
            | Self::BYPASS_LOGGING.bits();
    }
}

impl DeleteBehaviour {
    pub const NONE: DeleteBehaviour = DeleteBehaviour::empty();
}

/// Tells the caller whether a save reached the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(SaveMode),
    /// A saving handler cancelled the write.
    Cancelled,
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }
}
