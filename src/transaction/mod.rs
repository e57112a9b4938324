// ============================================================================
// Transaction Module
// ============================================================================
//
// Explicit transaction scopes for the save engine.
//
// A `TransactionContext` is created by the coordinator and handed to every
// call that should take part in the transaction. Scopes either own the
// context (root) or join it (nested). Providers enlist undo actions on the
// context and the engine enlists cache invalidation on completion.
//
// ============================================================================

pub mod context;
pub mod coordinator;
pub mod isolation;
pub mod scope;
pub mod state;

pub use context::TransactionContext;
pub use coordinator::{TransactionCoordinator, TransactionInfo};
pub use isolation::IsolationLevel;
pub use scope::{DefaultTransactionBackend, ScopeOption, TransactionBackend, TransactionScope};
pub use state::{TransactionId, TransactionOutcome, TransactionState};
