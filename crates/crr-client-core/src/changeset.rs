//! Changesets and migrations pushed by the server.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::SiteId;
use crate::value::Value;

/// Column id the server uses to mark a row deletion.
pub const DELETE_SENTINEL: &str = "__crsql_del";

/// A single column's last-known value for a row, tagged with the writer's clock.
///
/// `cid == None` (or the [`DELETE_SENTINEL`] column) is a row tombstone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Changeset {
    pub table: String,
    pub pk: Value,
    pub cid: Option<String>,
    pub val: Value,
    pub col_version: i64,
    pub db_version: i64,
    pub site_id: SiteId,
}

impl Changeset {
    /// Whether this changeset deletes the row.
    pub fn is_tombstone(&self) -> bool {
        match self.cid.as_deref() {
            None => true,
            Some(cid) => cid == DELETE_SENTINEL,
        }
    }

    /// The column this changeset writes, `None` for tombstones.
    pub fn column(&self) -> Option<&str> {
        if self.is_tombstone() {
            None
        } else {
            self.cid.as_deref()
        }
    }

    /// The clock this changeset was written at.
    pub fn clock(&self) -> Clock {
        Clock::new(self.col_version, self.site_id)
    }

    /// Approximate payload size in bytes.
    pub fn size(&self) -> usize {
        self.table.len()
            + self.pk.size()
            + self.cid.as_ref().map(String::len).unwrap_or_default()
            + self.val.size()
            + 16
            + SiteId::LEN
    }

    /// Structural checks that do not need the schema.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.table.is_empty() {
            return Err(CoreError::MalformedChangeset("empty table name".into()));
        }
        if self.pk.is_null() {
            return Err(CoreError::MalformedChangeset("null primary key".into()));
        }
        if self.col_version < 0 || self.db_version < 0 {
            return Err(CoreError::MalformedChangeset(format!(
                "negative version: col_version={}, db_version={}",
                self.col_version, self.db_version
            )));
        }
        Ok(())
    }
}

/// Last-writer-wins clock: `col_version` first, then `site_id` bytewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Clock {
    pub col_version: i64,
    pub site_id: SiteId,
}

impl Clock {
    pub const fn new(col_version: i64, site_id: SiteId) -> Self {
        Self {
            col_version,
            site_id,
        }
    }

    /// Whether a write at `self` replaces a value written at `other`.
    pub fn dominates(&self, other: &Clock) -> bool {
        self > other
    }
}

impl Ord for Clock {
    fn cmp(&self, other: &Self) -> Ordering {
        self.col_version
            .cmp(&other.col_version)
            .then_with(|| self.site_id.cmp(&other.site_id))
    }
}

impl PartialOrd for Clock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// An ordered schema statement. Versions start at 0 and have no gaps.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Migration {
    pub version: i64,
    pub sql: String,
}

impl Migration {
    pub fn new(version: i64, sql: impl Into<String>) -> Self {
        Self {
            version,
            sql: sql.into(),
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if self.version < 0 {
            return Err(CoreError::MalformedMigration(format!(
                "negative version {}",
                self.version
            )));
        }
        if self.sql.trim().is_empty() {
            return Err(CoreError::MalformedMigration(format!(
                "migration {} has no statements",
                self.version
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(b: u8) -> SiteId {
        SiteId::from_bytes([b; 16])
    }

    #[test]
    fn test_changeset_wire_format() {
        let json = format!(
            r#"{{"table":"foo","pk":"1","cid":"bar","val":"x","col_version":1,"db_version":1,"site_id":"{}"}}"#,
            site(0xA).to_base64()
        );
        let c: Changeset = serde_json::from_str(&json).unwrap();
        assert_eq!(c.table, "foo");
        assert_eq!(c.pk, Value::text("1"));
        assert_eq!(c.column(), Some("bar"));
        assert_eq!(c.site_id, site(0xA));
        assert!(!c.is_tombstone());
    }

    #[test]
    fn test_tombstone_forms() {
        let mut c = Changeset {
            table: "foo".into(),
            pk: Value::Integer(1),
            cid: None,
            val: Value::Null,
            col_version: 2,
            db_version: 3,
            site_id: site(1),
        };
        assert!(c.is_tombstone());
        c.cid = Some(DELETE_SENTINEL.into());
        assert!(c.is_tombstone());
        assert_eq!(c.column(), None);
    }

    #[test]
    fn test_clock_ordering() {
        assert!(Clock::new(2, site(0)).dominates(&Clock::new(1, site(9))));
        assert!(Clock::new(1, site(2)).dominates(&Clock::new(1, site(1))));
        assert!(!Clock::new(1, site(1)).dominates(&Clock::new(1, site(1))));
        assert!(!Clock::new(0, site(9)).dominates(&Clock::new(1, site(0))));
    }

    #[test]
    fn test_validate_rejects_null_pk() {
        let c = Changeset {
            table: "foo".into(),
            pk: Value::Null,
            cid: Some("bar".into()),
            val: Value::Null,
            col_version: 1,
            db_version: 1,
            site_id: site(1),
        };
        assert!(matches!(c.validate(), Err(CoreError::MalformedChangeset(_))));
    }

    #[test]
    fn test_migration_validate() {
        assert!(Migration::new(0, "CREATE TABLE foo(id)").validate().is_ok());
        assert!(Migration::new(-1, "CREATE TABLE foo(id)").validate().is_err());
        assert!(Migration::new(3, "   ").validate().is_err());
    }
}
