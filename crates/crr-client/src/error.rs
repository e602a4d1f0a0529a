//! Error types for the proxy.

use crr_client_store::StoreError;
use crr_client_sync::SyncError;
use thiserror::Error;

/// Invalid proxy configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid server url {url:?}: {reason}")]
    InvalidServerUrl { url: String, reason: String },

    #[error("database name must not be empty")]
    EmptyDbName,

    #[error("database name {0:?} must not contain '/'")]
    InvalidDbName(String),

    #[error("no bearer token configured")]
    MissingToken,
}

/// Errors that can occur during proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `install` has not been called.
    #[error("replica is not installed")]
    NotInstalled,

    /// A sync session is already running.
    #[error("sync session already active")]
    AlreadyActive,

    /// The server rejected a request.
    #[error("server responded {status}: {message}")]
    Server { status: u16, message: String },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
