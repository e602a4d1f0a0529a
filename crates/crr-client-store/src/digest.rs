//! Deterministic digest of a replica.
//!
//! Two replicas that have merged the same set of changesets on the same
//! schema produce the same digest, regardless of arrival order. The digest
//! covers the clock table and every user table, so it also catches a row
//! that drifted from its clocks.

use std::fmt;

use rusqlite::Connection;

use crr_client_core::Value;

use crate::bookkeeping::is_internal_table;
use crate::error::Result;
use crate::sql::{from_sql, quote_ident};

/// Blake3 digest of replica contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReplicaDigest(pub [u8; 32]);

impl ReplicaDigest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for ReplicaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReplicaDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ReplicaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hash clocks and user tables.
///
/// Layout:
/// 1. `"crr-digest-v0:"`
/// 2. every clock row ordered by `(tbl, pk, cid)`
/// 3. for every user table in name order: its name, then every row ordered
///    by all columns
pub fn compute_digest(conn: &Connection) -> Result<ReplicaDigest> {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"crr-digest-v0:");

    let mut stmt = conn.prepare(
        "SELECT tbl, pk, cid, col_version, site_id, val FROM __crr_clock
         ORDER BY tbl, pk, cid",
    )?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        for i in 0..6 {
            hash_value(&mut hasher, &from_sql(row.get_ref(i)?));
        }
    }

    for table in user_tables(conn)? {
        hash_value(&mut hasher, &Value::Text(table.clone()));

        let stmt = conn.prepare(&format!("SELECT * FROM {}", quote_ident(&table)))?;
        let n = stmt.column_count();
        drop(stmt);

        let order: Vec<String> = (1..=n).map(|i| i.to_string()).collect();
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} ORDER BY {}",
            quote_ident(&table),
            order.join(", ")
        ))?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            for i in 0..n {
                hash_value(&mut hasher, &from_sql(row.get_ref(i)?));
            }
        }
    }

    Ok(ReplicaDigest(*hasher.finalize().as_bytes()))
}

fn user_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names
        .into_iter()
        .filter(|name| !is_internal_table(name))
        .collect())
}

// Tag + length prefix keeps adjacent values from running together.
fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(&[0]);
        }
        Value::Integer(i) => {
            hasher.update(&[1]);
            hasher.update(&i.to_be_bytes());
        }
        Value::Real(r) => {
            hasher.update(&[2]);
            hasher.update(&r.to_bits().to_be_bytes());
        }
        Value::Text(s) => {
            hasher.update(&[3]);
            hasher.update(&(s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Blob(b) => {
            hasher.update(&[4]);
            hasher.update(&(b.len() as u64).to_be_bytes());
            hasher.update(b);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookkeeping;

    fn replica(rows: &[(&str, &str)]) -> Connection {
        let mut conn = Connection::open_in_memory().unwrap();
        bookkeeping::migrate(&mut conn).unwrap();
        conn.execute_batch("CREATE TABLE foo (id TEXT PRIMARY KEY, bar TEXT)")
            .unwrap();
        for (id, bar) in rows {
            conn.execute("INSERT INTO foo VALUES (?1, ?2)", [id, bar])
                .unwrap();
        }
        conn
    }

    #[test]
    fn test_digest_ignores_insert_order() {
        let a = replica(&[("1", "x"), ("2", "y")]);
        let b = replica(&[("2", "y"), ("1", "x")]);
        assert_eq!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_digest_sees_content() {
        let a = replica(&[("1", "x")]);
        let b = replica(&[("1", "y")]);
        assert_ne!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_digest_excludes_version_row() {
        let a = replica(&[]);
        let b = replica(&[]);
        bookkeeping::ensure_version_row(&a).unwrap();
        assert_eq!(compute_digest(&a).unwrap(), compute_digest(&b).unwrap());
    }

    #[test]
    fn test_debug_is_truncated() {
        let d = ReplicaDigest([0xab; 32]);
        assert_eq!(format!("{d:?}"), "ReplicaDigest(abababababababab)");
    }
}
