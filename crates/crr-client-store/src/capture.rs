//! Capture of writes made through intercepted statements.
//!
//! Every trackable user table (exactly one primary key column) carries three
//! triggers that note the primary key of each touched row in `__crr_dirty`.
//! After an intercepted statement runs, [`record_local_writes`] turns the
//! dirty rows into clock rows signed with this replica's site id, so they
//! compete in last-writer-wins exactly like server changesets and can be
//! uploaded.
//!
//! Merges and migrations touch user tables too; they call [`discard`] so
//! their writes are never mistaken for local ones.

use rusqlite::{params, Connection, OptionalExtension};

use crr_client_core::{Changeset, Clock, SiteId, Value, DELETE_SENTINEL};

use crate::bookkeeping::{self, is_internal_table, INTERNAL_PREFIX};
use crate::error::{Result, StoreError};
use crate::merge::{self, TableSchema};
use crate::sql::{from_sql, quote_ident};

/// Recreate the dirty-tracking triggers for the current schema.
///
/// Returns the number of tracked tables.
pub fn install_triggers(conn: &Connection) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'trigger'")?;
    let existing = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for name in existing.iter().filter(|n| n.starts_with(INTERNAL_PREFIX)) {
        conn.execute_batch(&format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
    }

    let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table'")?;
    let tables = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut tracked = 0;
    for table in tables.iter().filter(|t| !is_internal_table(t)) {
        let schema = match TableSchema::load(conn, table) {
            Ok(schema) => schema,
            Err(StoreError::InvalidChangeset { reason, .. }) => {
                tracing::debug!(table = %table, %reason, "table not tracked");
                continue;
            }
            Err(e) => return Err(e),
        };
        conn.execute_batch(&trigger_sql(&schema))?;
        tracked += 1;
    }

    Ok(tracked)
}

fn trigger_sql(schema: &TableSchema) -> String {
    let table = quote_ident(&schema.name);
    let pk = quote_ident(&schema.pk_column);
    let literal = format!("'{}'", schema.name.replace('\'', "''"));
    let name = |event: &str| quote_ident(&format!("{INTERNAL_PREFIX}{}_{event}", schema.name));
    let mark = |row: &str| {
        format!("INSERT OR IGNORE INTO __crr_dirty (tbl, pk) VALUES ({literal}, {row}.{pk});")
    };

    format!(
        "CREATE TRIGGER {insert} AFTER INSERT ON {table} BEGIN {new} END;
         CREATE TRIGGER {update} AFTER UPDATE ON {table} BEGIN {old} {new} END;
         CREATE TRIGGER {delete} AFTER DELETE ON {table} BEGIN {old} END;",
        insert = name("insert"),
        update = name("update"),
        delete = name("delete"),
        new = mark("NEW"),
        old = mark("OLD"),
    )
}

/// Forget rows marked dirty by writes that are not local.
pub fn discard(conn: &Connection) -> Result<()> {
    conn.execute("DELETE FROM __crr_dirty", [])?;
    Ok(())
}

/// Record clock rows for every row touched since the last capture.
///
/// All clock rows written by one call share one new local version. Returns
/// the number of clock rows written.
pub fn record_local_writes(conn: &Connection, site_id: SiteId) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT tbl, pk FROM __crr_dirty ORDER BY tbl, pk")?;
    let dirty = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, rusqlite::types::Value>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if dirty.is_empty() {
        return Ok(0);
    }

    let version = bookkeeping::next_local_version(conn)?;
    let mut written = 0;

    for (table, pk) in &dirty {
        // The statement may have dropped the table.
        let schema = match TableSchema::load(conn, table) {
            Ok(schema) => schema,
            Err(StoreError::InvalidChangeset { .. }) => continue,
            Err(e) => return Err(e),
        };

        let clocks = merge::load_row_clocks(conn, table, pk)?;
        let highest = |cid: Option<&str>| {
            clocks
                .iter()
                .filter(|c| cid.map_or(true, |cid| c.cid == cid || c.cid == DELETE_SENTINEL))
                .map(|c| c.clock.col_version)
                .max()
                .unwrap_or(0)
        };

        match read_row(conn, &schema, pk)? {
            Some(row) => {
                let revived = !merge::is_live(&clocks);
                for (column, val) in row {
                    if column == schema.pk_column {
                        continue;
                    }
                    let recorded = clocks.iter().find(|c| c.cid == column);
                    if !revived && recorded.is_some_and(|c| c.val == val) {
                        continue;
                    }
                    let clock = Clock::new(highest(Some(column.as_str())) + 1, site_id);
                    merge::upsert_clock(conn, table, pk, &column, clock, &val, version)?;
                    written += 1;
                }
                conn.execute(
                    "DELETE FROM __crr_pending WHERE tbl = ?1 AND pk = ?2",
                    params![table, pk],
                )?;
            }
            None if merge::is_live(&clocks) => {
                let clock = Clock::new(highest(None) + 1, site_id);
                merge::upsert_clock(conn, table, pk, DELETE_SENTINEL, clock, &Value::Null, version)?;
                written += 1;
            }
            None => {}
        }
    }

    discard(conn)?;
    tracing::debug!(rows = dirty.len(), clocks = written, version, "captured local writes");
    Ok(written)
}

fn read_row(
    conn: &Connection,
    schema: &TableSchema,
    pk: &rusqlite::types::Value,
) -> Result<Option<Vec<(String, Value)>>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT * FROM {} WHERE {} = ?1",
        quote_ident(&schema.name),
        quote_ident(&schema.pk_column)
    ))?;
    let names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();

    Ok(stmt
        .query_row(params![pk], |row| {
            names
                .iter()
                .enumerate()
                .map(|(i, name)| Ok((name.clone(), from_sql(row.get_ref(i)?))))
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .optional()?)
}

/// Local clock rows newer than `since`, in local version order.
pub fn local_changes(conn: &Connection, site_id: SiteId, since: i64) -> Result<Vec<Changeset>> {
    let mut stmt = conn.prepare(
        "SELECT tbl, pk, cid, val, col_version, db_version FROM __crr_clock
         WHERE site_id = ?1 AND db_version > ?2
         ORDER BY db_version, tbl, pk, cid",
    )?;
    let changes = stmt
        .query_map(params![site_id.as_bytes().as_slice(), since], |row| {
            Ok(Changeset {
                table: row.get(0)?,
                pk: from_sql(row.get_ref(1)?),
                cid: Some(row.get(2)?),
                val: from_sql(row.get_ref(3)?),
                col_version: row.get(4)?,
                db_version: row.get(5)?,
                site_id,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(changes)
}
