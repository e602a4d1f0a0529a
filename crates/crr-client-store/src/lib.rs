//! # CRR Client Store
//!
//! Local replica storage for the CRR client. Provides the [`ReplicaStore`]
//! trait and its SQLite implementation, [`SqliteReplica`].
//!
//! ## Overview
//!
//! The store is the sole owner of the embedded database handle and of the
//! replica's [`VersionState`](crr_client_core::VersionState). Every mutation
//! of local data (migration, changeset merge, intercepted statement) goes
//! through it and is serialized behind one connection mutex.
//!
//! ## Key Types
//!
//! - [`ReplicaStore`] - The async trait for all replica operations
//! - [`SqliteReplica`] - SQLite-backed replica
//! - [`MigrationOutcome`] / [`MergeOutcome`] - Results of applying server events
//! - [`ReplicaDigest`] - Deterministic hash of replica contents
//!
//! ## Usage
//!
//! ```rust,no_run
//! use crr_client_core::{Migration, RunRequest};
//! use crr_client_store::{ReplicaStore, SqliteReplica};
//!
//! async fn example() {
//!     let replica = SqliteReplica::open("app.sqlite3").unwrap();
//!     let version = replica.install().await.unwrap();
//!     println!("site {} at schema {}", version.site_id, version.schema_version);
//!
//!     let migration = Migration::new(0, "CREATE TABLE foo (id TEXT PRIMARY KEY, bar TEXT)");
//!     replica.apply_migration(&migration).await.unwrap();
//!
//!     let rows = replica
//!         .execute(&RunRequest::all("SELECT * FROM foo", vec![]))
//!         .await
//!         .unwrap();
//!     assert!(rows.rows.is_empty());
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Atomic version bumps**: `schema_version` and `db_version` are written in
//!   the same transaction as the change that produced them
//! - **Clock table**: per-column `(col_version, site_id)` clocks are kept in
//!   `__crr_clock`; a table row is always re-derived from its clock rows
//! - **Idempotent applies**: redelivered migrations and changesets are no-ops
//! - **Local writes**: rows changed by intercepted statements get clock rows
//!   under this replica's site id and a local version kept apart from the
//!   server cursor, ready for upload

pub mod bookkeeping;
pub mod capture;
pub mod digest;
pub mod error;
pub mod merge;
pub mod sql;
pub mod sqlite;
pub mod traits;

pub use digest::ReplicaDigest;
pub use error::{Result, StoreError};
pub use sqlite::SqliteReplica;
pub use traits::{AppliedMigration, MergeOutcome, MigrationOutcome, ReplicaStore};
