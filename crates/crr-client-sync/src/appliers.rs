//! Appliers: the only paths by which server events mutate the replica.
//!
//! [`MigrationApplier`] enforces gapless migration order and halts the
//! replica after a failed migration. [`ChangesetApplier`] merges changesets
//! and refuses work while the replica is halted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crr_client_core::{Changeset, Migration};
use crr_client_store::{MergeOutcome, MigrationOutcome, ReplicaStore, StoreError};

use crate::error::{Result, SyncError};

/// Shared halt flag, set when a migration fails.
///
/// Cloning shares the flag, so a halt seen by the migration applier also
/// stops the changeset applier (and survives a reconnect when the owner
/// keeps a clone).
#[derive(Debug, Clone, Default)]
pub struct HaltLatch(Arc<AtomicBool>);

impl HaltLatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_halted(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn halt(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Allow work again, after the replica has been repaired or reset.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.is_halted() {
            Err(SyncError::ReplicaHalted)
        } else {
            Ok(())
        }
    }
}

/// Applies migrations in strict version order.
pub struct MigrationApplier<S: ReplicaStore> {
    store: Arc<S>,
    halt: HaltLatch,
}

impl<S: ReplicaStore> MigrationApplier<S> {
    pub fn new(store: Arc<S>, halt: HaltLatch) -> Self {
        Self { store, halt }
    }

    /// Apply one migration.
    ///
    /// # Errors
    /// - `ReplicaHalted` if an earlier migration failed.
    /// - `Store(OutOfOrderMigration)` if the version skips ahead.
    /// - `Store(MigrationFailed)` if the SQL fails; the latch is set.
    pub async fn apply(&self, migration: &Migration) -> Result<MigrationOutcome> {
        self.halt.check()?;

        match self.store.apply_migration(migration).await {
            Ok(outcome) => Ok(outcome),
            Err(e @ StoreError::MigrationFailed { .. }) => {
                tracing::error!(version = migration.version, error = %e, "migration failed, halting replica");
                self.halt.halt();
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }
}

/// Counts from applying a batch of changesets.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchReport {
    /// Changesets that won their slot (including deferred rows).
    pub applied: usize,
    /// Changesets dominated by a recorded clock.
    pub stale: usize,
    /// Changesets skipped as invalid.
    pub invalid: usize,
}

impl BatchReport {
    pub fn record(&mut self, outcome: MergeOutcome) {
        match outcome {
            MergeOutcome::Applied | MergeOutcome::Deferred => self.applied += 1,
            MergeOutcome::Stale => self.stale += 1,
        }
    }
}

/// Merges changesets with last-writer-wins.
pub struct ChangesetApplier<S: ReplicaStore> {
    store: Arc<S>,
    halt: HaltLatch,
}

impl<S: ReplicaStore> ChangesetApplier<S> {
    pub fn new(store: Arc<S>, halt: HaltLatch) -> Self {
        Self { store, halt }
    }

    /// Merge one changeset.
    ///
    /// An invalid changeset comes back as `Store(InvalidChangeset)`, which
    /// is not fatal; the cursor has already moved past it.
    pub async fn apply(&self, changeset: &Changeset) -> Result<MergeOutcome> {
        self.halt.check()?;
        Ok(self.store.apply_changeset(changeset).await?)
    }

    /// Apply changesets one by one. Invalid ones are counted and skipped;
    /// the first fatal error stops the batch.
    pub async fn apply_batch(&self, changesets: &[Changeset]) -> Result<BatchReport> {
        let mut report = BatchReport::default();
        for changeset in changesets {
            match self.apply(changeset).await {
                Ok(outcome) => report.record(outcome),
                Err(SyncError::Store(StoreError::InvalidChangeset { table, reason })) => {
                    tracing::warn!(%table, %reason, "skipping invalid changeset");
                    report.invalid += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crr_client_core::{SiteId, Value};
    use crr_client_store::SqliteReplica;

    async fn store() -> Arc<SqliteReplica> {
        let store = SqliteReplica::open_memory().unwrap();
        store.install().await.unwrap();
        Arc::new(store)
    }

    fn change(table: &str, pk: i64, val: &str, col_version: i64, db_version: i64) -> Changeset {
        Changeset {
            table: table.into(),
            pk: Value::Integer(pk),
            cid: Some("bar".into()),
            val: Value::text(val),
            col_version,
            db_version,
            site_id: SiteId::from_bytes([3; 16]),
        }
    }

    #[tokio::test]
    async fn test_failed_migration_halts_everything() {
        let store = store().await;
        let halt = HaltLatch::new();
        let migrations = MigrationApplier::new(store.clone(), halt.clone());
        let changes = ChangesetApplier::new(store.clone(), halt.clone());

        let err = migrations
            .apply(&Migration::new(0, "CREATE TABLE"))
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(migrations.is_halted());

        let err = migrations
            .apply(&Migration::new(0, "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::ReplicaHalted));

        let err = changes.apply(&change("foo", 1, "x", 1, 1)).await.unwrap_err();
        assert!(matches!(err, SyncError::ReplicaHalted));
        assert_eq!(store.current_version().unwrap().db_version, 0);

        halt.reset();
        migrations
            .apply(&Migration::new(0, "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_out_of_order_does_not_halt() {
        let store = store().await;
        let migrations = MigrationApplier::new(store, HaltLatch::new());

        let err = migrations
            .apply(&Migration::new(1, "CREATE TABLE foo (id INTEGER PRIMARY KEY)"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Store(StoreError::OutOfOrderMigration {
                expected: 0,
                got: 1
            })
        ));
        assert!(err.is_fatal());
        assert!(!migrations.is_halted());
    }

    #[tokio::test]
    async fn test_batch_skips_invalid() {
        let store = store().await;
        let halt = HaltLatch::new();
        MigrationApplier::new(store.clone(), halt.clone())
            .apply(&Migration::new(0, "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT)"))
            .await
            .unwrap();
        let changes = ChangesetApplier::new(store.clone(), halt);

        let report = changes
            .apply_batch(&[
                change("foo", 1, "a", 1, 1),
                change("missing", 1, "b", 1, 2),
                change("foo", 1, "stale", 1, 3),
                change("foo", 2, "c", 1, 4),
            ])
            .await
            .unwrap();

        assert_eq!(
            report,
            BatchReport {
                applied: 2,
                stale: 1,
                invalid: 1
            }
        );
        assert_eq!(store.current_version().unwrap().db_version, 4);
    }
}
