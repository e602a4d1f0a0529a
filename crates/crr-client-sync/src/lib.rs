//! # CRR Client Sync
//!
//! Keeps a local replica attached to the server's change stream.
//!
//! ## Overview
//!
//! A [`SyncSession`] signs the stream URL through an [`Authenticator`],
//! opens it through a [`ChangeFeed`], and dispatches each server event in
//! arrival order:
//!
//! - `migration` events go to the [`MigrationApplier`]
//! - `change` events go to the [`ChangesetApplier`]
//! - `error` events are surfaced as [`SyncNotice::Error`] and trigger a
//!   reconnect
//!
//! Connection failures are retried with exponential backoff
//! ([`RetryConfig`]). Every reconnect resumes from the replica's current
//! `(schema_version, db_version)`.
//!
//! ## Key Properties
//!
//! - **Ordered**: each event is fully applied before the next is read
//! - **Resumable**: the cursor is persisted with every apply
//! - **Fail-stop**: a failed migration halts the replica
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use crr_client_store::{ReplicaStore, SqliteReplica};
//! use crr_client_sync::{HttpAuthenticator, HttpChangeFeed, SessionConfig, SyncSession};
//! use crr_client_sync::Url;
//!
//! async fn example() {
//!     let server = Url::parse("https://sync.example.com").unwrap();
//!     let store = Arc::new(SqliteReplica::open("app.sqlite3").unwrap());
//!     store.install().await.unwrap();
//!
//!     let session = SyncSession::new(
//!         store,
//!         Arc::new(HttpAuthenticator::new(server.clone(), "token")),
//!         Arc::new(HttpChangeFeed::new()),
//!         SessionConfig::new(server, "app"),
//!     );
//!     let shutdown = session.shutdown_handle();
//!     let task = tokio::spawn(session.run());
//!
//!     // ...
//!     shutdown.shutdown();
//!     let report = task.await.unwrap().unwrap();
//!     println!("applied {} changesets", report.changesets.applied);
//! }
//! ```

pub mod appliers;
pub mod auth;
pub mod error;
pub mod feed;
pub mod messages;
pub mod retry;
pub mod session;
pub mod urls;

pub use appliers::{BatchReport, ChangesetApplier, HaltLatch, MigrationApplier};
pub use auth::{memory::StaticAuthenticator, Authenticator, HttpAuthenticator};
pub use error::{Result, SyncError};
pub use feed::{
    memory::{MemoryFeed, ScriptedConnection},
    ChangeFeed, EventStream, HttpChangeFeed,
};
pub use messages::{RawEvent, ServerEvent};
pub use retry::RetryConfig;
pub use session::{
    SessionConfig, SessionReport, SessionState, ShutdownHandle, SyncNotice, SyncSession,
};

pub use reqwest::Url;
