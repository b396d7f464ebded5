//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on state {state_id}: expected {expected}, found {found}")]
    VersionConflict {
        state_id: String,
        expected: u64,
        found: u64,
    },
}

impl StoreError {
    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Open(_)
                | StoreError::Transaction(_)
                | StoreError::Table(_)
                | StoreError::Read(_)
                | StoreError::Write(_)
                | StoreError::VersionConflict { .. }
        )
    }
}
