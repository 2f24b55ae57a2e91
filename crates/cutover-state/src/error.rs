//! Errors raised by the Cutover state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Failures of the redb-backed store and of the records it holds.
#[derive(Debug, Error)]
pub enum StateError {
    /// The database file could not be created or opened.
    #[error("failed to open state database: {0}")]
    Open(String),

    #[error("state transaction error: {0}")]
    Transaction(String),

    #[error("state table error: {0}")]
    Table(String),

    #[error("state read error: {0}")]
    Read(String),

    #[error("state write error: {0}")]
    Write(String),

    /// A record could not be encoded as JSON.
    #[error("record serialization error: {0}")]
    Serialize(String),

    /// A stored value no longer decodes as the expected record.
    #[error("record deserialization error: {0}")]
    Deserialize(String),

    /// A record or a stage within one does not exist.
    #[error("record not found: {0}")]
    NotFound(String),

    /// A value that is written once, such as a stage's committed
    /// artifacts, was written again.
    #[error("immutable record: {0}")]
    Immutable(String),
}
