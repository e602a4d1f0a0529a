//! Bookkeeping schema for the replica.
//!
//! The replica keeps its own metadata next to the user's tables. The
//! bookkeeping schema is versioned separately from server migrations: each
//! step here transforms it from version N to N+1 and runs at install time.

use rusqlite::{params, Connection, OptionalExtension};

use crr_client_core::{SiteId, VersionState};

use crate::error::{Result, StoreError};

/// Current bookkeeping schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Prefix reserved for bookkeeping tables.
pub const INTERNAL_PREFIX: &str = "__crr_";

/// Whether a table name belongs to the bookkeeping schema or SQLite itself.
pub fn is_internal_table(name: &str) -> bool {
    name.starts_with(INTERNAL_PREFIX) || name.starts_with("sqlite_")
}

/// Initialize or upgrade the bookkeeping schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS __crr_bookkeeping (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM __crr_bookkeeping",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_step(&tx, version)?;

            tx.execute(
                "INSERT INTO __crr_bookkeeping (version, applied_at) VALUES (?1, ?2)",
                params![version, now_millis()],
            )?;
        }

        tx.commit()?;
        tracing::debug!(version = CURRENT_VERSION, "bookkeeping schema upgraded");
    }

    Ok(())
}

fn apply_step(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Bookkeeping(format!(
            "unknown bookkeeping version: {}",
            version
        ))),
    }
}

/// Bookkeeping v1: version state, migration history, column clocks.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Single row holding the replica's version state
        CREATE TABLE __crr_meta (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            site_id BLOB NOT NULL,            -- 16 bytes, never reassigned
            schema_version INTEGER NOT NULL,  -- -1 until the first migration
            db_version INTEGER NOT NULL       -- sync cursor, monotone
        );

        -- Server migrations applied to this replica
        CREATE TABLE __crr_migrations (
            version INTEGER PRIMARY KEY,
            sql TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        );

        -- Winning clock and value per (table, primary key, column)
        CREATE TABLE __crr_clock (
            tbl TEXT NOT NULL,
            pk NOT NULL,                      -- no affinity: stored as sent
            cid TEXT NOT NULL,                -- '__crsql_del' for tombstones
            col_version INTEGER NOT NULL,
            site_id BLOB NOT NULL,
            val,
            PRIMARY KEY (tbl, pk, cid)
        );
        "#,
    )?;

    Ok(())
}

/// Bookkeeping v2: local write capture, upload cursor, deferred rows.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Version each clock row was written at (origin db_version)
        ALTER TABLE __crr_clock ADD COLUMN db_version INTEGER NOT NULL DEFAULT 0;

        -- Clock for writes made on this replica, and how far they were uploaded
        ALTER TABLE __crr_meta ADD COLUMN local_version INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE __crr_meta ADD COLUMN uploaded_version INTEGER NOT NULL DEFAULT 0;

        -- Rows whose clocks are recorded but which violate a constraint
        CREATE TABLE __crr_pending (
            tbl TEXT NOT NULL,
            pk NOT NULL,
            PRIMARY KEY (tbl, pk)
        );

        -- Rows touched since the last capture, filled by triggers
        CREATE TABLE __crr_dirty (
            tbl TEXT NOT NULL,
            pk NOT NULL,
            PRIMARY KEY (tbl, pk)
        );
        "#,
    )?;

    Ok(())
}

/// Create the version row with a fresh site id unless one exists.
///
/// Returns the stored state.
pub fn ensure_version_row(conn: &Connection) -> Result<VersionState> {
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO __crr_meta (id, site_id, schema_version, db_version)
         VALUES (1, ?1, -1, 0)",
        params![SiteId::random().as_bytes().as_slice()],
    )?;

    let state = read_version(conn)?.ok_or(StoreError::NotInstalled)?;
    if inserted > 0 {
        tracing::info!(site_id = %state.site_id, "generated replica site id");
    }
    Ok(state)
}

/// Read the version row, `None` if the replica was never installed.
pub fn read_version(conn: &Connection) -> Result<Option<VersionState>> {
    let row: Option<(Vec<u8>, i64, i64)> = conn
        .query_row(
            "SELECT site_id, schema_version, db_version FROM __crr_meta WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    row.map(|(site_id, schema_version, db_version)| {
        let site_id = SiteId::try_from(site_id.as_slice())
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        Ok(VersionState {
            site_id,
            schema_version,
            db_version,
        })
    })
    .transpose()
}

/// Advance the stored cursor to `max(db_version, seen)`.
pub fn observe_db_version(conn: &Connection, seen: i64) -> Result<()> {
    conn.execute(
        "UPDATE __crr_meta SET db_version = MAX(db_version, ?1) WHERE id = 1",
        params![seen],
    )?;
    Ok(())
}

/// Record a migration and bump the schema version.
pub fn record_migration(conn: &Connection, version: i64, sql: &str) -> Result<()> {
    conn.execute(
        "UPDATE __crr_meta SET schema_version = ?1 WHERE id = 1",
        params![version],
    )?;
    conn.execute(
        "INSERT INTO __crr_migrations (version, sql, applied_at) VALUES (?1, ?2, ?3)",
        params![version, sql, now_millis()],
    )?;
    Ok(())
}

/// Advance the local write clock and return its new value.
pub fn next_local_version(conn: &Connection) -> Result<i64> {
    conn.execute(
        "UPDATE __crr_meta SET local_version = local_version + 1 WHERE id = 1",
        [],
    )?;
    Ok(conn.query_row(
        "SELECT local_version FROM __crr_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

/// Highest local version the server has acknowledged.
pub fn uploaded_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT uploaded_version FROM __crr_meta WHERE id = 1",
        [],
        |row| row.get(0),
    )?)
}

/// Advance the upload cursor to `max(uploaded_version, version)`.
pub fn acknowledge_upload(conn: &Connection, version: i64) -> Result<()> {
    conn.execute(
        "UPDATE __crr_meta SET uploaded_version = MAX(uploaded_version, ?1) WHERE id = 1",
        params![version],
    )?;
    Ok(())
}

/// Get current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
