//! Version state of a replica.
//!
//! A replica is at exactly one `(schema_version, db_version)` pair at any
//! time. Both only move forward, and both are persisted in the same
//! transaction as the change that produced them.

use serde::{Deserialize, Serialize};

use crate::types::SiteId;

/// Schema version of a replica on which no migration has been applied.
pub const NO_SCHEMA: i64 = -1;

/// Version state of one tracked database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionState {
    /// This replica's identity.
    pub site_id: SiteId,

    /// Highest migration version fully applied, or `-1`.
    pub schema_version: i64,

    /// Logical clock bounding how much of the change history has been merged.
    pub db_version: i64,
}

/// Where a migration sits relative to the current schema version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationOrder {
    /// Exactly `schema_version + 1`: apply it.
    Next,
    /// Already covered by `schema_version`: redelivery, nothing to do.
    AlreadyApplied,
    /// Skips at least one version.
    Gap { expected: i64 },
}

impl VersionState {
    /// Version state of a freshly installed replica.
    pub fn fresh(site_id: SiteId) -> Self {
        Self {
            site_id,
            schema_version: NO_SCHEMA,
            db_version: 0,
        }
    }

    /// The version the next migration must carry.
    pub fn next_schema_version(&self) -> i64 {
        self.schema_version + 1
    }

    /// Classify an incoming migration version.
    pub fn classify_migration(&self, version: i64) -> MigrationOrder {
        let expected = self.next_schema_version();
        if version == expected {
            MigrationOrder::Next
        } else if (0..expected).contains(&version) {
            MigrationOrder::AlreadyApplied
        } else {
            MigrationOrder::Gap { expected }
        }
    }

    /// Advance the sync cursor to `max(db_version, seen)`.
    ///
    /// Returns whether the cursor moved.
    pub fn observe_db_version(&mut self, seen: i64) -> bool {
        if seen > self.db_version {
            self.db_version = seen;
            true
        } else {
            false
        }
    }

    /// Whether no migration has been applied yet.
    pub fn has_schema(&self) -> bool {
        self.schema_version > NO_SCHEMA
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn state(schema_version: i64, db_version: i64) -> VersionState {
        VersionState {
            site_id: SiteId::ZERO,
            schema_version,
            db_version,
        }
    }

    #[test]
    fn test_fresh_state_floor() {
        let s = VersionState::fresh(SiteId::from_bytes([7; 16]));
        assert_eq!(s.schema_version, -1);
        assert_eq!(s.db_version, 0);
        assert!(!s.has_schema());
    }

    #[test]
    fn test_classify_migration() {
        let s = state(0, 0);
        assert_eq!(s.classify_migration(1), MigrationOrder::Next);
        assert_eq!(s.classify_migration(0), MigrationOrder::AlreadyApplied);
        assert_eq!(
            s.classify_migration(2),
            MigrationOrder::Gap { expected: 1 }
        );
        assert_eq!(
            s.classify_migration(-5),
            MigrationOrder::Gap { expected: 1 }
        );
    }

    #[test]
    fn test_first_migration_on_fresh_replica() {
        let s = state(-1, 0);
        assert_eq!(s.classify_migration(0), MigrationOrder::Next);
        assert_eq!(
            s.classify_migration(1),
            MigrationOrder::Gap { expected: 0 }
        );
    }

    proptest! {
        #[test]
        fn test_db_version_never_decreases(seen in prop::collection::vec(-10i64..1000, 0..50)) {
            let mut s = state(-1, 0);
            let mut prev = s.db_version;
            for v in seen {
                s.observe_db_version(v);
                prop_assert!(s.db_version >= prev);
                prev = s.db_version;
            }
        }
    }
}
