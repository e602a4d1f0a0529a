//! Last-writer-wins merge of changesets into plain tables.
//!
//! Every changeset first competes for its `(table, pk, cid)` slot in the
//! clock table: it wins iff its `(col_version, site_id)` clock is strictly
//! greater than the recorded one. When it wins, the table row is re-derived
//! from all clock rows for that primary key:
//!
//! - a tombstone that dominates every column clock deletes the row;
//! - otherwise the row is upserted with every recorded column value.
//!
//! A row that violates a constraint (a NOT NULL column still missing, a
//! UNIQUE value another row holds) is recorded in `__crr_pending`. While a
//! table has pending rows every merge into it rebuilds all of its clocked
//! rows in primary key order, so which row ends up written is decided by the
//! clocks alone.
//!
//! Because the rows are a function of the clock rows alone, and the clock
//! rows only ever keep the maximum, application is idempotent and
//! independent of arrival order.

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crr_client_core::{Changeset, Clock, SiteId, Value, DELETE_SENTINEL};

use crate::bookkeeping::is_internal_table;
use crate::error::{Result, StoreError};
use crate::sql::{from_sql, quote_ident, to_sql};
use crate::traits::MergeOutcome;

/// The parts of a table's schema the merge needs.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub name: String,
    pub pk_column: String,
    pub columns: Vec<String>,
}

impl TableSchema {
    /// Load the schema of a user table.
    ///
    /// Unknown tables, bookkeeping tables and tables without exactly one
    /// primary key column are rejected as `InvalidChangeset`.
    pub fn load(conn: &Connection, table: &str) -> Result<Self> {
        if is_internal_table(table) {
            return Err(StoreError::invalid_changeset(table, "internal table"));
        }

        let exists: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![table],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_none() {
            return Err(StoreError::invalid_changeset(table, "unknown table"));
        }

        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
        let info: Vec<(String, i64)> = stmt
            .query_map([], |row| Ok((row.get("name")?, row.get("pk")?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut pk_columns = info.iter().filter(|(_, pk)| *pk > 0).map(|(n, _)| n);
        let pk_column = match (pk_columns.next(), pk_columns.next()) {
            (Some(pk), None) => pk.clone(),
            (None, _) => {
                return Err(StoreError::invalid_changeset(table, "table has no primary key"))
            }
            (Some(_), Some(_)) => {
                return Err(StoreError::invalid_changeset(
                    table,
                    "composite primary keys are not supported",
                ))
            }
        };

        Ok(Self {
            name: table.to_owned(),
            pk_column,
            columns: info.into_iter().map(|(name, _)| name).collect(),
        })
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }
}

/// A recorded clock row.
#[derive(Debug, Clone)]
pub(crate) struct ClockRow {
    pub cid: String,
    pub clock: Clock,
    pub val: Value,
}

enum RowWrite {
    Written,
    Deferred,
}

/// Merge one changeset. Must run inside a transaction.
///
/// Does not touch `db_version`; the caller bumps the cursor in the same
/// transaction.
pub fn merge_changeset(conn: &Connection, changeset: &Changeset) -> Result<MergeOutcome> {
    changeset
        .validate()
        .map_err(|e| StoreError::invalid_changeset(&changeset.table, e.to_string()))?;

    let schema = TableSchema::load(conn, &changeset.table)?;

    let cid = match changeset.column() {
        Some(column) if column == schema.pk_column => {
            return Err(StoreError::invalid_changeset(
                &changeset.table,
                format!("column {column:?} is the primary key"),
            ))
        }
        Some(column) if !schema.has_column(column) => {
            return Err(StoreError::invalid_changeset(
                &changeset.table,
                format!("unknown column {column:?}"),
            ))
        }
        Some(column) => column,
        None => DELETE_SENTINEL,
    };

    let pk = to_sql(&changeset.pk);
    let incoming = changeset.clock();

    if let Some(recorded) = load_clock(conn, &schema.name, &pk, cid)? {
        if !incoming.dominates(&recorded) {
            tracing::trace!(
                table = %schema.name,
                cid,
                incoming = incoming.col_version,
                recorded = recorded.col_version,
                "stale changeset"
            );
            return Ok(MergeOutcome::Stale);
        }
    }

    let val = if changeset.is_tombstone() {
        Value::Null
    } else {
        changeset.val.clone()
    };
    upsert_clock(conn, &schema.name, &pk, cid, incoming, &val, changeset.db_version)?;

    let outcome = settle(conn, &schema, &pk)?;
    crate::capture::discard(conn)?;
    Ok(outcome)
}

/// Record the winning clock of one `(table, pk, cid)` slot.
pub(crate) fn upsert_clock(
    conn: &Connection,
    table: &str,
    pk: &rusqlite::types::Value,
    cid: &str,
    clock: Clock,
    val: &Value,
    db_version: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO __crr_clock (tbl, pk, cid, col_version, site_id, val, db_version)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT (tbl, pk, cid) DO UPDATE SET
            col_version = excluded.col_version,
            site_id = excluded.site_id,
            val = excluded.val,
            db_version = excluded.db_version",
        params![
            table,
            pk,
            cid,
            clock.col_version,
            clock.site_id.as_bytes().as_slice(),
            to_sql(val),
            db_version,
        ],
    )?;
    Ok(())
}

fn load_clock(
    conn: &Connection,
    table: &str,
    pk: &rusqlite::types::Value,
    cid: &str,
) -> Result<Option<Clock>> {
    let row: Option<(i64, Vec<u8>)> = conn
        .query_row(
            "SELECT col_version, site_id FROM __crr_clock
             WHERE tbl = ?1 AND pk = ?2 AND cid = ?3",
            params![table, pk, cid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    row.map(|(col_version, site_id)| Ok(Clock::new(col_version, parse_site_id(&site_id)?)))
        .transpose()
}

pub(crate) fn load_row_clocks(
    conn: &Connection,
    table: &str,
    pk: &rusqlite::types::Value,
) -> Result<Vec<ClockRow>> {
    let mut stmt = conn.prepare(
        "SELECT cid, col_version, site_id, val FROM __crr_clock
         WHERE tbl = ?1 AND pk = ?2 ORDER BY cid",
    )?;
    let raw = stmt
        .query_map(params![table, pk], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Vec<u8>>(2)?,
                from_sql(row.get_ref(3)?),
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    raw.into_iter()
        .map(|(cid, col_version, site_id, val)| {
            Ok(ClockRow {
                cid,
                clock: Clock::new(col_version, parse_site_id(&site_id)?),
                val,
            })
        })
        .collect()
}

pub(crate) fn parse_site_id(bytes: &[u8]) -> Result<SiteId> {
    SiteId::try_from(bytes).map_err(|e| StoreError::InvalidData(e.to_string()))
}

/// Whether the clock rows describe a live row.
///
/// Live means there is at least one column clock and no tombstone that
/// dominates all of them.
pub(crate) fn is_live(clocks: &[ClockRow]) -> bool {
    let tombstone = clocks.iter().find(|c| c.cid == DELETE_SENTINEL);
    let mut columns = clocks.iter().filter(|c| c.cid != DELETE_SENTINEL).peekable();
    if columns.peek().is_none() {
        return false;
    }
    match tombstone {
        None => true,
        Some(t) => columns.any(|c| c.clock.dominates(&t.clock)),
    }
}

/// Bring the table in line with the clocks after `pk` changed.
fn settle(
    conn: &Connection,
    schema: &TableSchema,
    pk: &rusqlite::types::Value,
) -> Result<MergeOutcome> {
    if !has_pending(conn, &schema.name)? {
        if let RowWrite::Written = write_row(conn, schema, pk)? {
            return Ok(MergeOutcome::Applied);
        }
    }

    rebuild(conn, schema)?;
    if is_pending(conn, &schema.name, pk)? {
        Ok(MergeOutcome::Deferred)
    } else {
        Ok(MergeOutcome::Applied)
    }
}

fn has_pending(conn: &Connection, table: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM __crr_pending WHERE tbl = ?1 LIMIT 1",
            params![table],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn is_pending(conn: &Connection, table: &str, pk: &rusqlite::types::Value) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM __crr_pending WHERE tbl = ?1 AND pk = ?2",
            params![table, pk],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

/// Re-derive every clocked row of a table in primary key order.
///
/// Rows without clocks (seeded by migrations) are left alone.
fn rebuild(conn: &Connection, schema: &TableSchema) -> Result<()> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT pk FROM __crr_clock WHERE tbl = ?1 ORDER BY pk",
    )?;
    let pks = stmt
        .query_map(params![schema.name], |row| {
            row.get::<_, rusqlite::types::Value>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    conn.execute(
        "DELETE FROM __crr_pending WHERE tbl = ?1",
        params![schema.name],
    )?;

    let delete = format!(
        "DELETE FROM {} WHERE {} = ?1",
        quote_ident(&schema.name),
        quote_ident(&schema.pk_column)
    );
    for pk in &pks {
        conn.execute(&delete, params![pk])?;
    }

    let mut deferred = 0usize;
    for pk in &pks {
        if let RowWrite::Deferred = write_row(conn, schema, pk)? {
            deferred += 1;
        }
    }

    tracing::debug!(table = %schema.name, rows = pks.len(), deferred, "rebuilt table from clocks");
    Ok(())
}

/// Write one row from its clock rows, or record it as pending.
fn write_row(
    conn: &Connection,
    schema: &TableSchema,
    pk: &rusqlite::types::Value,
) -> Result<RowWrite> {
    let clocks = load_row_clocks(conn, &schema.name, pk)?;
    let columns: Vec<&ClockRow> = clocks
        .iter()
        .filter(|c| c.cid != DELETE_SENTINEL && schema.has_column(&c.cid))
        .collect();

    let table = quote_ident(&schema.name);
    let pk_column = quote_ident(&schema.pk_column);

    conn.execute(
        "DELETE FROM __crr_pending WHERE tbl = ?1 AND pk = ?2",
        params![schema.name, pk],
    )?;

    if !is_live(&clocks) || columns.is_empty() {
        conn.execute(
            &format!("DELETE FROM {table} WHERE {pk_column} = ?1"),
            params![pk],
        )?;
        return Ok(RowWrite::Written);
    }

    let names: Vec<String> = columns.iter().map(|c| quote_ident(&c.cid)).collect();
    let placeholders: Vec<String> = (2..=names.len() + 1).map(|i| format!("?{i}")).collect();
    let updates: Vec<String> = names
        .iter()
        .map(|n| format!("{n} = excluded.{n}"))
        .collect();

    let sql = format!(
        "INSERT INTO {table} ({pk_column}, {cols}) VALUES (?1, {vals})
         ON CONFLICT ({pk_column}) DO UPDATE SET {updates}",
        cols = names.join(", "),
        vals = placeholders.join(", "),
        updates = updates.join(", "),
    );

    let mut values = Vec::with_capacity(columns.len() + 1);
    values.push(pk.clone());
    values.extend(columns.iter().map(|c| to_sql(&c.val)));

    match conn.execute(&sql, rusqlite::params_from_iter(values)) {
        Ok(_) => Ok(RowWrite::Written),
        Err(rusqlite::Error::SqliteFailure(e, message))
            if e.code == ErrorCode::ConstraintViolation =>
        {
            tracing::debug!(
                table = %schema.name,
                reason = message.as_deref().unwrap_or("constraint violation"),
                "row violates a constraint, write deferred"
            );
            // The failed upsert may have left a stale version of the row.
            conn.execute(
                &format!("DELETE FROM {table} WHERE {pk_column} = ?1"),
                params![pk],
            )?;
            conn.execute(
                "INSERT INTO __crr_pending (tbl, pk) VALUES (?1, ?2)",
                params![schema.name, pk],
            )?;
            Ok(RowWrite::Deferred)
        }
        Err(e) => Err(StoreError::invalid_changeset(&schema.name, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeping;

    fn site(b: u8) -> SiteId {
        SiteId::from_bytes([b; 16])
    }

    fn setup() -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        bookkeeping::migrate(&mut conn).unwrap();
        conn.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, bar TEXT, baz INTEGER)")
            .unwrap();
        conn
    }

    fn change(cid: Option<&str>, val: Value, col_version: i64, site_id: SiteId) -> Changeset {
        Changeset {
            table: "foo".into(),
            pk: Value::text("1"),
            cid: cid.map(String::from),
            val,
            col_version,
            db_version: col_version,
            site_id,
        }
    }

    fn bar(conn: &Connection) -> Option<String> {
        conn.query_row("SELECT bar FROM foo WHERE id = '1'", [], |row| row.get(0))
            .optional()
            .unwrap()
            .flatten()
    }

    fn row_exists(conn: &Connection) -> bool {
        conn.query_row("SELECT COUNT(*) FROM foo WHERE id = '1'", [], |row| {
            row.get::<_, i64>(0)
        })
        .unwrap()
            == 1
    }

    #[test]
    fn test_higher_col_version_wins() {
        let conn = setup();
        let newer = change(Some("bar"), Value::text("x"), 1, site(0xA));
        let older = change(Some("bar"), Value::text("y"), 0, site(0xA));

        assert_eq!(merge_changeset(&conn, &newer).unwrap(), MergeOutcome::Applied);
        assert_eq!(merge_changeset(&conn, &older).unwrap(), MergeOutcome::Stale);
        assert_eq!(bar(&conn).as_deref(), Some("x"));
    }

    #[test]
    fn test_site_id_breaks_ties() {
        let conn = setup();
        let low = change(Some("bar"), Value::text("low"), 3, site(1));
        let high = change(Some("bar"), Value::text("high"), 3, site(2));

        merge_changeset(&conn, &high).unwrap();
        assert_eq!(merge_changeset(&conn, &low).unwrap(), MergeOutcome::Stale);
        assert_eq!(bar(&conn).as_deref(), Some("high"));
    }

    #[test]
    fn test_duplicate_is_stale() {
        let conn = setup();
        let c = change(Some("bar"), Value::text("x"), 1, site(1));
        assert_eq!(merge_changeset(&conn, &c).unwrap(), MergeOutcome::Applied);
        assert_eq!(merge_changeset(&conn, &c).unwrap(), MergeOutcome::Stale);
    }

    #[test]
    fn test_tombstone_deletes_and_newer_write_resurrects() {
        let conn = setup();
        merge_changeset(&conn, &change(Some("bar"), Value::text("x"), 1, site(1))).unwrap();
        merge_changeset(&conn, &change(None, Value::Null, 2, site(1))).unwrap();
        assert!(!row_exists(&conn));

        merge_changeset(&conn, &change(Some("bar"), Value::text("z"), 3, site(1))).unwrap();
        assert_eq!(bar(&conn).as_deref(), Some("z"));
    }

    #[test]
    fn test_dominated_tombstone_keeps_row() {
        let conn = setup();
        merge_changeset(&conn, &change(Some("bar"), Value::text("x"), 5, site(1))).unwrap();
        merge_changeset(&conn, &change(Some(DELETE_SENTINEL), Value::Null, 2, site(1)))
            .unwrap();
        assert_eq!(bar(&conn).as_deref(), Some("x"));
    }

    #[test]
    fn test_old_write_after_tombstone_stays_deleted() {
        let conn = setup();
        merge_changeset(&conn, &change(None, Value::Null, 4, site(1))).unwrap();
        merge_changeset(&conn, &change(Some("bar"), Value::text("x"), 1, site(1))).unwrap();
        assert!(!row_exists(&conn));
    }

    #[test]
    fn test_unknown_table_and_column_are_invalid() {
        let conn = setup();
        let mut c = change(Some("bar"), Value::text("x"), 1, site(1));
        c.table = "missing".into();
        assert!(matches!(
            merge_changeset(&conn, &c),
            Err(StoreError::InvalidChangeset { .. })
        ));

        let c = change(Some("nope"), Value::text("x"), 1, site(1));
        assert!(matches!(
            merge_changeset(&conn, &c),
            Err(StoreError::InvalidChangeset { .. })
        ));

        let mut c = change(Some("cid"), Value::text("x"), 1, site(1));
        c.table = "__crr_clock".into();
        assert!(matches!(
            merge_changeset(&conn, &c),
            Err(StoreError::InvalidChangeset { .. })
        ));
    }

    #[test]
    fn test_not_null_column_defers_until_complete() {
        let conn = setup();
        conn.execute_batch("CREATE TABLE strict (id INTEGER PRIMARY KEY, a TEXT NOT NULL, b TEXT NOT NULL)")
            .unwrap();
        let mut first = change(Some("a"), Value::text("a"), 1, site(1));
        first.table = "strict".into();
        first.pk = Value::Integer(1);
        let mut second = first.clone();
        second.cid = Some("b".into());
        second.val = Value::text("b");

        assert_eq!(merge_changeset(&conn, &first).unwrap(), MergeOutcome::Deferred);
        assert_eq!(merge_changeset(&conn, &second).unwrap(), MergeOutcome::Applied);

        let (a, b): (String, String) = conn
            .query_row("SELECT a, b FROM strict WHERE id = 1", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!((a.as_str(), b.as_str()), ("a", "b"));
    }

    #[test]
    fn test_unique_conflict_settles_the_same_in_any_order() {
        let mail = |pk: i64, email: &str, col_version: i64, site_id: SiteId| Changeset {
            table: "mail".into(),
            pk: Value::Integer(pk),
            cid: Some("email".into()),
            val: Value::text(email),
            col_version,
            db_version: col_version,
            site_id,
        };
        let changes = [
            mail(1, "e", 1, site(1)),
            mail(1, "f", 2, site(1)),
            mail(2, "e", 1, site(2)),
        ];

        for order in [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]] {
            let conn = setup();
            conn.execute_batch("CREATE TABLE mail (id INTEGER PRIMARY KEY, email TEXT UNIQUE)")
                .unwrap();

            let outcomes: Vec<MergeOutcome> = order
                .iter()
                .map(|&i| merge_changeset(&conn, &changes[i]).unwrap())
                .collect();
            if order == [0, 2, 1] {
                assert_eq!(outcomes[1], MergeOutcome::Deferred);
            }

            let rows: Vec<(i64, String)> = conn
                .prepare("SELECT id, email FROM mail ORDER BY id")
                .unwrap()
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
                .unwrap()
                .collect::<rusqlite::Result<_>>()
                .unwrap();
            assert_eq!(
                rows,
                vec![(1, "f".to_string()), (2, "e".to_string())],
                "order {order:?}"
            );

            let pending: i64 = conn
                .query_row("SELECT COUNT(*) FROM __crr_pending", [], |row| row.get(0))
                .unwrap();
            assert_eq!(pending, 0, "order {order:?}");
        }
    }

    #[test]
    fn test_table_schema_load() {
        let conn = setup();
        let schema = TableSchema::load(&conn, "foo").unwrap();
        assert_eq!(schema.pk_column, "id");
        assert!(schema.has_column("baz"));

        conn.execute_batch("CREATE TABLE pair (a TEXT, b TEXT, PRIMARY KEY (a, b))")
            .unwrap();
        assert!(matches!(
            TableSchema::load(&conn, "pair"),
            Err(StoreError::InvalidChangeset { .. })
        ));
    }
}
