//! Error types for the migration engine
//!
//! One crate-level error enum covering registry faults, graph validation
//! faults, execution failures, and lock/confirmation rejections.

use thiserror::Error;

/// Result type alias for engine operations
pub type StratumResult<T> = Result<T, MigrationError>;

/// Error types for migration operations
#[derive(Debug, Clone, Error)]
pub enum MigrationError {
    /// Two registered definitions share the same id
    #[error("Duplicate migration id '{id}'")]
    DuplicateId { id: String },

    /// A definition is missing required fields or carries an invalid identifier
    #[error("Malformed migration definition '{id}': {reason}")]
    MalformedDefinition { id: String, reason: String },

    /// A declared dependency does not exist in the registry
    #[error("Migration '{id}' depends on unknown migration '{dependency}'")]
    DanglingDependency { id: String, dependency: String },

    /// The dependency graph contains a cycle and no execution order exists
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    CycleDetected { cycle: Vec<String> },

    /// An apply or revert operation failed; its transaction was rolled back
    #[error("Migration '{id}' failed: {reason}")]
    Execution { id: String, reason: String },

    /// The targeted migration declared no revert operation
    #[error("Migration '{id}' does not support revert")]
    RevertUnavailable { id: String },

    /// Rollback was requested but the ledger holds no entries
    #[error("No executed migrations to roll back")]
    NothingToRevert,

    /// A ledger entry references an id that no longer exists in the registry
    #[error("Migration '{id}' is not present in the registry")]
    UnknownMigration { id: String },

    /// A run or rollback was attempted while another one holds the run lock
    #[error("Another migration run is already in flight")]
    LockContention,

    /// The confirmation token supplied for a destructive operation did not match
    #[error("Confirmation token mismatch; refusing to reset the ledger")]
    ConfirmationRejected,

    /// Database or backing-store error
    #[error("Database error: {0}")]
    Database(String),

    /// Filesystem error while loading or scaffolding migration files
    #[error("IO error: {0}")]
    Io(String),
}

impl From<sqlx::Error> for MigrationError {
    fn from(err: sqlx::Error) -> Self {
        MigrationError::Database(err.to_string())
    }
}

impl From<std::io::Error> for MigrationError {
    fn from(err: std::io::Error) -> Self {
        MigrationError::Io(err.to_string())
    }
}
