//! ReplicaStore trait: the abstract interface to the local replica.
//!
//! The session and the proxy only talk to the replica through this trait,
//! which keeps them testable against any backend.

use async_trait::async_trait;
use crr_client_core::{Changeset, Migration, RunRequest, RunResponse, VersionState};

use crate::digest::ReplicaDigest;
use crate::error::Result;

/// Result of applying a migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOutcome {
    /// The migration ran and `schema_version` now equals `version`.
    Applied { version: i64 },
    /// The migration was already covered by `schema_version` (redelivery).
    AlreadyApplied { version: i64 },
}

/// Result of merging a changeset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The changeset won and the row was re-derived.
    Applied,
    /// An equal or newer clock is already recorded; only the cursor moved.
    Stale,
    /// The clock was recorded but the row violates a constraint (a NOT NULL
    /// column has not arrived, a UNIQUE value is held by another row). It is
    /// retried whenever the same table changes.
    Deferred,
}

/// A migration recorded in the replica's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedMigration {
    pub version: i64,
    pub sql: String,
    /// When it was applied locally (Unix ms).
    pub applied_at: i64,
}

/// The ReplicaStore trait: async interface to one tracked database.
///
/// # Design Notes
///
/// - **Single writer**: mutating calls are serialized per replica.
/// - **Snapshot reads**: [`current_version`](ReplicaStore::current_version)
///   never waits on a writer.
/// - **Atomicity**: each apply commits its data change and its version bump
///   together, or neither.
#[async_trait]
pub trait ReplicaStore: Send + Sync {
    /// Create bookkeeping tables and the site id if absent. Idempotent.
    async fn install(&self) -> Result<VersionState>;

    /// Run an arbitrary statement against live data.
    ///
    /// Rows it changes are recorded as local changes for upload.
    async fn execute(&self, request: &RunRequest) -> Result<RunResponse>;

    /// Snapshot of the replica's version state.
    fn current_version(&self) -> Result<VersionState>;

    /// Apply the next migration.
    ///
    /// # Returns
    /// - `Applied` if `version == schema_version + 1` and the SQL succeeded.
    /// - `AlreadyApplied` if `version <= schema_version`.
    ///
    /// # Errors
    /// - `OutOfOrderMigration` if the version skips ahead.
    /// - `MigrationFailed` if the SQL fails (nothing is applied).
    async fn apply_migration(&self, migration: &Migration) -> Result<MigrationOutcome>;

    /// Merge a changeset using last-writer-wins by `(col_version, site_id)`.
    ///
    /// `db_version` advances to `max(db_version, changeset.db_version)` even
    /// when the changeset is stale or invalid.
    async fn apply_changeset(&self, changeset: &Changeset) -> Result<MergeOutcome>;

    /// Migrations applied to this replica, in version order.
    async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>>;

    /// Deterministic hash over clocks and user table contents.
    async fn digest(&self) -> Result<ReplicaDigest>;

    /// Local changes the server has not acknowledged, oldest first.
    ///
    /// Each changeset's `db_version` is the local version it was written at.
    async fn local_changes(&self) -> Result<Vec<Changeset>>;

    /// Mark local changes up to `version` as uploaded.
    async fn acknowledge_upload(&self, version: i64) -> Result<()>;
}
