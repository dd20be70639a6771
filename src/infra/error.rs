//! Error types for the inventory pipeline infrastructure

use thiserror::Error;

/// Errors that can occur in the inventory pipeline
#[derive(Error, Debug)]
pub enum InventoryError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Migration error
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Malformed mutation field
    #[error("invalid {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    /// Negative quantity in an upsert
    #[error("invalid quantity: {0} (must be >= 0)")]
    InvalidQuantity(i64),

    /// No record for the requested key
    #[error("record not found: {store}/{item}")]
    NotFound { store: String, item: String },

    /// Stale write (optimistic concurrency)
    #[error("version conflict for {store}/{item}: expected {expected}, got {actual}")]
    VersionConflict {
        store: String,
        item: String,
        expected: u64,
        actual: u64,
    },

    /// Change log read returned a non-contiguous sequence
    #[error("sequence gap: expected {expected}, got {actual}")]
    SequenceGap { expected: u64, actual: u64 },

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Operation abandoned because shutdown was requested
    #[error("operation cancelled")]
    Cancelled,

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error taxonomy used for propagation decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Malformed input; skip and report, never batch-fatal
    InvalidInput,
    /// Absent data; callers see an empty result
    NotFound,
    /// Transient; retry with bounded backoff
    Retryable,
    /// Irrecoverable; surface to an operator
    Fatal,
}

impl InventoryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            InventoryError::InvalidInput { .. }
            | InventoryError::InvalidQuantity(_)
            | InventoryError::VersionConflict { .. } => ErrorClass::InvalidInput,
            InventoryError::NotFound { .. } => ErrorClass::NotFound,
            InventoryError::Database(e) if super::retry::is_retryable_db_error(e) => {
                ErrorClass::Retryable
            }
            // A gap means a commit is not yet visible to this reader
            InventoryError::SequenceGap { .. } => ErrorClass::Retryable,
            InventoryError::Database(_)
            | InventoryError::Migration(_)
            | InventoryError::Configuration(_)
            | InventoryError::Cancelled
            | InventoryError::Internal(_) => ErrorClass::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Result type for inventory operations
pub type Result<T> = std::result::Result<T, InventoryError>;
