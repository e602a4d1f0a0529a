//! # CRR Client
//!
//! Client-side synchronization proxy for a replicated SQLite database.
//!
//! ## Overview
//!
//! A [`SyncProxy`] owns a local replica of one tracked database and:
//!
//! - **Syncs** it against the server's change stream, applying migrations in
//!   strict order and merging changesets with last-writer-wins
//! - **Intercepts** query requests aimed at the server's `run` endpoint and
//!   answers them from the replica
//! - **Uploads** the writes those requests make, recorded with this
//!   replica's site id, through [`SyncProxy::upload_changes`]
//!
//! Every replica that has seen the same changesets converges to the same
//! state, whatever the order or duplication of delivery.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crr_client::{HttpSyncProxy, ProxyConfig};
//!
//! async fn example() -> crr_client::Result<()> {
//!     let config = ProxyConfig::new("https://sync.example.com", "app")?.with_token("secret");
//!     let proxy = HttpSyncProxy::open(config, "app.sqlite3")?;
//!
//!     proxy.install().await?;
//!     proxy.activate().await?;
//!
//!     // In the request path:
//!     // if proxy.should_handle(&request) {
//!     //     return proxy.respond_to(&request).await;
//!     // }
//!
//!     proxy.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! - `crr_client::core` - Wire types and version state
//! - `crr_client::store` - Replica storage
//! - `crr_client::sync` - Change stream session

pub mod config;
pub mod error;
pub mod interceptor;
pub mod proxy;
pub mod submit;

pub use config::ProxyConfig;
pub use error::{ConfigError, ProxyError, Result};
pub use interceptor::{ProxyRequest, ProxyResponse, RequestInterceptor};
pub use proxy::{HttpSyncProxy, SyncProxy};
pub use submit::{HttpChangeUploader, HttpMigrationSubmitter};

pub use crr_client_core as core;
pub use crr_client_store as store;
pub use crr_client_sync as sync;

pub use reqwest::Method;
