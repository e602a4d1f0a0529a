//! Error types for the CRR client core.

use thiserror::Error;

/// Errors raised while decoding or validating core values.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid site id: {0}")]
    InvalidSiteId(String),

    #[error("malformed changeset: {0}")]
    MalformedChangeset(String),

    #[error("malformed migration: {0}")]
    MalformedMigration(String),

    #[error("decoding error: {0}")]
    DecodingError(#[from] serde_json::Error),
}
