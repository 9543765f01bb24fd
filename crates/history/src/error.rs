//! History log errors

use thiserror::Error;

/// Errors raised by the history log and its stores
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Backing store failed
    #[error("History storage error: {0}")]
    Storage(String),

    /// SQLite operation failed
    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Attribute value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Attribute name is reserved for the lifecycle
    #[error("Attribute '{0}' is reserved and cannot be updated")]
    ProtectedAttribute(String),

    /// No history exists for the command
    #[error("Unknown command: {0}")]
    UnknownCommand(String),
}
