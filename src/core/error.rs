use crate::entity::ValidationErrors;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EntityError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{0}")]
    StaleInstance(String),

    #[error("{0} '{1}' is already saved and cannot be inserted again")]
    AlreadySaved(String, String),

    #[error("{0} instance is immutable. Clone it before making changes.")]
    ImmutableEntity(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    #[error("Concurrency conflict: {0}")]
    Concurrency(String),

    #[error("Unsupported capability: {0}")]
    Capability(String),

    #[error("{0} '{1}' not found")]
    NotFound(String, String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Lock error: {0}")]
    LockError(String),
}

impl EntityError {
    /// True for errors caused by broken business rules.
    pub fn is_validation(&self) -> bool {
        matches!(self, EntityError::Validation(_))
    }

    /// True for errors that indicate a stale or conflicting write.
    pub fn is_concurrency(&self) -> bool {
        matches!(
            self,
            EntityError::StaleInstance(_) | EntityError::Concurrency(_) | EntityError::AlreadySaved(..)
        )
    }
}

pub type Result<T> = std::result::Result<T, EntityError>;

impl<T> From<std::sync::PoisonError<T>> for EntityError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<ValidationErrors> for EntityError {
    fn from(errors: ValidationErrors) -> Self {
        Self::Validation(errors)
    }
}
