//! Error types for the sync module.

use thiserror::Error;

use crr_client_store::StoreError;

/// Errors that can occur while syncing a replica.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The auth endpoint refused to sign the stream URL.
    #[error("auth error: {message}")]
    Auth { message: String },

    /// Transport-level error (connect, read, HTTP status).
    #[error("transport error: {0}")]
    Transport(String),

    /// The server reported an error on the stream.
    #[error("stream error: {message}")]
    Stream { message: String },

    /// An event could not be decoded.
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    /// A migration failed earlier; the replica refuses further work.
    #[error("replica halted after a failed migration")]
    ReplicaHalted,

    /// Reconnecting failed too many times in a row.
    #[error("gave up after {attempts} consecutive failed connection attempts")]
    RetriesExhausted { attempts: u32 },

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A server URL could not be turned into an endpoint.
    #[error("invalid url: {0}")]
    InvalidUrl(String),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl SyncError {
    /// Errors that end the session instead of triggering a reconnect.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Store(e) => e.is_fatal(),
            SyncError::ReplicaHalted
            | SyncError::RetriesExhausted { .. }
            | SyncError::InvalidUrl(_) => true,
            SyncError::Auth { .. }
            | SyncError::Transport(_)
            | SyncError::Stream { .. }
            | SyncError::InvalidEvent(_)
            | SyncError::Cancelled => false,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(SyncError::ReplicaHalted.is_fatal());
        assert!(SyncError::Store(StoreError::MigrationFailed {
            version: 1,
            cause: "syntax error".into()
        })
        .is_fatal());
        assert!(!SyncError::Store(StoreError::InvalidChangeset {
            table: "foo".into(),
            reason: "unknown column".into()
        })
        .is_fatal());
        assert!(!SyncError::Transport("reset".into()).is_fatal());
        assert!(!SyncError::Auth {
            message: "expired".into()
        }
        .is_fatal());
    }
}
