//! Error types for the store module.

use thiserror::Error;

/// Errors that can occur during replica operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The embedded database could not be opened.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// A caller-supplied statement failed.
    #[error("{message}")]
    Query { message: String },

    /// A migration skipped at least one version.
    #[error("out of order migration: expected version {expected}, got {got}")]
    OutOfOrderMigration { expected: i64, got: i64 },

    /// A migration's statements failed; nothing was applied.
    #[error("migration {version} failed: {cause}")]
    MigrationFailed { version: i64, cause: String },

    /// A changeset cannot be merged into the local schema.
    #[error("invalid changeset for table {table:?}: {reason}")]
    InvalidChangeset { table: String, reason: String },

    /// The replica has not been installed yet.
    #[error("replica is not installed")]
    NotInstalled,

    /// Database error from SQLite.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Invalid data in the bookkeeping tables.
    #[error("invalid data: {0}")]
    InvalidData(String),

    /// Bookkeeping schema migration error.
    #[error("bookkeeping migration error: {0}")]
    Bookkeeping(String),

    /// The connection mutex was poisoned by a panicking writer.
    #[error("connection mutex poisoned")]
    Poisoned,

    /// The blocking task running a statement failed.
    #[error("blocking task failed: {0}")]
    Join(String),
}

impl StoreError {
    /// Errors after which the replica must not keep syncing.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::StorageUnavailable(_)
                | StoreError::OutOfOrderMigration { .. }
                | StoreError::MigrationFailed { .. }
                | StoreError::NotInstalled
                | StoreError::Database(_)
                | StoreError::InvalidData(_)
                | StoreError::Bookkeeping(_)
                | StoreError::Poisoned
                | StoreError::Join(_)
        )
    }

    pub(crate) fn invalid_changeset(table: &str, reason: impl Into<String>) -> Self {
        StoreError::InvalidChangeset {
            table: table.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
