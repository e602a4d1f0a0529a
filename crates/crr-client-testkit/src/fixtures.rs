//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use crr_client_core::{Changeset, Migration, RunRequest, SiteId, Value};
use crr_client_store::{ReplicaStore, SqliteReplica};

/// The table most tests sync.
pub const FOO_TABLE: &str = "CREATE TABLE foo (id INTEGER PRIMARY KEY, bar TEXT, baz INTEGER)";

/// A table whose rows compete for a UNIQUE column.
pub const MAIL_TABLE: &str = "CREATE TABLE mail (id INTEGER PRIMARY KEY, email TEXT UNIQUE)";

/// A deterministic site id.
pub fn site(byte: u8) -> SiteId {
    SiteId::from_bytes([byte; 16])
}

/// A column write on `foo`.
pub fn set_foo(
    site_id: SiteId,
    pk: i64,
    column: &str,
    val: impl Into<Value>,
    col_version: i64,
    db_version: i64,
) -> Changeset {
    Changeset {
        table: "foo".into(),
        pk: Value::Integer(pk),
        cid: Some(column.into()),
        val: val.into(),
        col_version,
        db_version,
        site_id,
    }
}

/// A row delete on `foo`.
pub fn delete_foo(site_id: SiteId, pk: i64, col_version: i64, db_version: i64) -> Changeset {
    Changeset {
        table: "foo".into(),
        pk: Value::Integer(pk),
        cid: None,
        val: Value::Null,
        col_version,
        db_version,
        site_id,
    }
}

/// An installed in-memory replica.
pub async fn installed_replica() -> anyhow::Result<SqliteReplica> {
    let replica = SqliteReplica::open_memory()?;
    replica.install().await?;
    Ok(replica)
}

/// An installed in-memory replica with `migrations` applied as versions
/// `0..n`.
pub async fn replica_with_schema(migrations: &[&str]) -> anyhow::Result<SqliteReplica> {
    let replica = installed_replica().await?;
    for (version, sql) in migrations.iter().enumerate() {
        replica
            .apply_migration(&Migration::new(version as i64, *sql))
            .await?;
    }
    Ok(replica)
}

/// All rows of `foo`, ordered by primary key.
pub async fn foo_rows<S: ReplicaStore>(store: &S) -> anyhow::Result<Vec<Vec<Value>>> {
    let response = store
        .execute(&RunRequest::all("SELECT id, bar, baz FROM foo ORDER BY id", vec![]))
        .await?;
    Ok(response.rows)
}

/// All rows of `mail`, ordered by primary key.
pub async fn mail_rows<S: ReplicaStore>(store: &S) -> anyhow::Result<Vec<Vec<Value>>> {
    let response = store
        .execute(&RunRequest::all("SELECT id, email FROM mail ORDER BY id", vec![]))
        .await?;
    Ok(response.rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_replica_with_schema() {
        let replica = replica_with_schema(&[FOO_TABLE]).await.unwrap();
        assert_eq!(replica.current_version().unwrap().schema_version, 0);

        replica
            .apply_changeset(&set_foo(site(1), 1, "bar", "x", 1, 1))
            .await
            .unwrap();
        assert_eq!(
            foo_rows(&replica).await.unwrap(),
            vec![vec![Value::Integer(1), Value::text("x"), Value::Null]]
        );
    }
}
