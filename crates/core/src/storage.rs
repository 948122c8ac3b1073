//! Safety state persistence.

use concord_types::SafetyState;

/// Errors from the safety state store.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encoding error: {0}")]
    Encoding(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for [`SafetyState`].
pub trait SafetyStateStore: Send + Sync {
    /// Load the last stored state, if any.
    fn load(&self) -> Result<Option<SafetyState>, PersistenceError>;

    /// Store `state`. Must be durable when this returns `Ok`.
    fn store(&self, state: &SafetyState) -> Result<(), PersistenceError>;
}
