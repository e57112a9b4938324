pub mod error;
pub mod record;
pub mod types;

pub use error::{EntityError, Result};
pub use record::{AggregateFunction, Criterion, EntityRecord, Operator, Query};
pub use types::{DeleteBehaviour, EntityId, EntityType, IdStrategy, SaveBehaviour, SaveMode, SaveOutcome};
