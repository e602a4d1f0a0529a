//! SQLite implementation of the ReplicaStore trait.
//!
//! One connection per replica, behind a mutex, driven through
//! `tokio::task::spawn_blocking`. After every write the version row is read
//! back while the lock is still held and published to a snapshot, so
//! `current_version` never blocks and never observes a version older than
//! the last commit.

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rusqlite::{params, Connection};

use crr_client_core::{
    Changeset, Migration, MigrationOrder, RunRequest, RunResponse, VersionState,
};

use crate::bookkeeping;
use crate::capture;
use crate::digest::{compute_digest, ReplicaDigest};
use crate::error::{Result, StoreError};
use crate::merge;
use crate::sql;
use crate::traits::{AppliedMigration, MergeOutcome, MigrationOutcome, ReplicaStore};

/// SQLite-backed replica of one tracked database.
pub struct SqliteReplica {
    conn: Arc<Mutex<Connection>>,
    snapshot: Arc<RwLock<Option<VersionState>>>,
}

impl SqliteReplica {
    /// Open (or create) a replica at the given path.
    ///
    /// Bookkeeping tables are created here; the site id is only generated
    /// by [`install`](ReplicaStore::install).
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).map_err(|e| {
            StoreError::StorageUnavailable(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory replica.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| StoreError::StorageUnavailable(e.to_string()))?;
        Self::from_connection(conn)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        bookkeeping::migrate(&mut conn)?;
        let snapshot = bookkeeping::read_version(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            snapshot: Arc::new(RwLock::new(snapshot)),
        })
    }

    /// Run a mutating operation and republish the version snapshot.
    async fn write<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        let snapshot = self.snapshot.clone();

        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            let result = f(&mut conn);

            if let Ok(Some(state)) = bookkeeping::read_version(&conn) {
                if let Ok(mut guard) = snapshot.write() {
                    *guard = Some(state);
                }
            }

            result
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }

    /// Run a read-only operation.
    async fn read<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().map_err(|_| StoreError::Poisoned)?;
            f(&conn)
        })
        .await
        .map_err(|e| StoreError::Join(e.to_string()))?
    }
}

fn require_installed(conn: &Connection) -> Result<VersionState> {
    bookkeeping::read_version(conn)?.ok_or(StoreError::NotInstalled)
}

#[async_trait]
impl ReplicaStore for SqliteReplica {
    async fn install(&self) -> Result<VersionState> {
        self.write(|conn| {
            let state = bookkeeping::ensure_version_row(conn)?;
            capture::install_triggers(conn)?;
            Ok(state)
        })
        .await
    }

    async fn execute(&self, request: &RunRequest) -> Result<RunResponse> {
        let request = request.clone();
        self.write(move |conn| {
            let tx = conn.transaction()?;
            let site_id = bookkeeping::read_version(&tx)?.map(|state| state.site_id);
            capture::discard(&tx)?;

            let response = sql::run_statement(&tx, &request)?;
            if let Some(site_id) = site_id {
                capture::record_local_writes(&tx, site_id)?;
            }
            tx.commit()?;
            Ok(response)
        })
        .await
    }

    fn current_version(&self) -> Result<VersionState> {
        let guard = self.snapshot.read().map_err(|_| StoreError::Poisoned)?;
        (*guard).ok_or(StoreError::NotInstalled)
    }

    async fn apply_migration(&self, migration: &Migration) -> Result<MigrationOutcome> {
        let migration = migration.clone();

        self.write(move |conn| {
            let version = migration.version;
            let tx = conn.transaction()?;
            let state = require_installed(&tx)?;

            match state.classify_migration(version) {
                MigrationOrder::Next => {}
                MigrationOrder::AlreadyApplied => {
                    tracing::debug!(version, "migration already applied");
                    return Ok(MigrationOutcome::AlreadyApplied { version });
                }
                MigrationOrder::Gap { expected } => {
                    return Err(StoreError::OutOfOrderMigration {
                        expected,
                        got: version,
                    });
                }
            }

            tx.execute_batch(&migration.sql)
                .map_err(|e| StoreError::MigrationFailed {
                    version,
                    cause: e.to_string(),
                })?;
            bookkeeping::record_migration(&tx, version, &migration.sql)?;
            capture::install_triggers(&tx)?;
            capture::discard(&tx)?;
            tx.commit()?;

            tracing::info!(version, "applied migration");
            Ok(MigrationOutcome::Applied { version })
        })
        .await
    }

    async fn apply_changeset(&self, changeset: &Changeset) -> Result<MergeOutcome> {
        let changeset = changeset.clone();

        self.write(move |conn| {
            require_installed(conn)?;

            let tx = conn.transaction()?;
            let merged = merge::merge_changeset(&tx, &changeset);
            match merged {
                Ok(outcome) => {
                    bookkeeping::observe_db_version(&tx, changeset.db_version)?;
                    tx.commit()?;
                    Ok(outcome)
                }
                Err(e @ StoreError::InvalidChangeset { .. }) => {
                    tx.rollback()?;

                    let tx = conn.transaction()?;
                    bookkeeping::observe_db_version(&tx, changeset.db_version)?;
                    tx.commit()?;

                    tracing::warn!(error = %e, db_version = changeset.db_version, "skipped changeset");
                    Err(e)
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT version, sql, applied_at FROM __crr_migrations ORDER BY version",
            )?;
            let migrations = stmt
                .query_map(params![], |row| {
                    Ok(AppliedMigration {
                        version: row.get(0)?,
                        sql: row.get(1)?,
                        applied_at: row.get(2)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(migrations)
        })
        .await
    }

    async fn digest(&self) -> Result<ReplicaDigest> {
        self.read(compute_digest).await
    }

    async fn local_changes(&self) -> Result<Vec<Changeset>> {
        self.read(|conn| {
            let state = require_installed(conn)?;
            let since = bookkeeping::uploaded_version(conn)?;
            capture::local_changes(conn, state.site_id, since)
        })
        .await
    }

    async fn acknowledge_upload(&self, version: i64) -> Result<()> {
        self.write(move |conn| bookkeeping::acknowledge_upload(conn, version))
            .await
    }
}
