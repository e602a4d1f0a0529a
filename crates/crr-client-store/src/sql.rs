//! Statement execution and value conversion helpers.

use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, Row};

use crr_client_core::{RunMethod, RunRequest, RunResponse, Value};

use crate::error::{Result, StoreError};

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Convert a wire value into an owned SQLite value.
pub fn to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Integer(v) => SqlValue::Integer(*v),
        Value::Real(v) => SqlValue::Real(*v),
        Value::Text(v) => SqlValue::Text(v.clone()),
        Value::Blob(v) => SqlValue::Blob(v.clone()),
    }
}

/// Convert a borrowed SQLite value into a wire value.
pub fn from_sql(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Integer(v),
        ValueRef::Real(v) => Value::Real(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

fn read_row(row: &Row<'_>, column_count: usize) -> rusqlite::Result<Vec<Value>> {
    (0..column_count)
        .map(|i| row.get_ref(i).map(from_sql))
        .collect()
}

fn query_error(e: rusqlite::Error) -> StoreError {
    StoreError::Query {
        message: e.to_string(),
    }
}

/// Run a caller-supplied statement and shape its result like the remote
/// execution endpoint does.
///
/// `run` executes and reports affected rows; a statement that yields rows
/// is an error. `get` returns exactly the first row and fails when there is
/// none. Every other method returns all rows.
pub fn run_statement(conn: &Connection, request: &RunRequest) -> Result<RunResponse> {
    let mut stmt = conn.prepare(&request.sql).map_err(query_error)?;
    let column_count = stmt.column_count();
    let params = params_from_iter(request.params.iter().map(to_sql));

    tracing::debug!(method = ?request.method, sql = %request.sql, "executing local statement");

    match request.method {
        RunMethod::Run => {
            let changes = stmt.execute(params).map_err(query_error)?;
            Ok(RunResponse {
                rows: Vec::new(),
                changes: Some(changes),
            })
        }
        RunMethod::Get => {
            let row = stmt
                .query_row(params, |row| read_row(row, column_count))
                .map_err(query_error)?;
            Ok(RunResponse {
                rows: vec![row],
                changes: None,
            })
        }
        RunMethod::All | RunMethod::Values => {
            let mut raw_rows = stmt.query(params).map_err(query_error)?;
            let mut rows = Vec::new();
            while let Some(row) = raw_rows.next().map_err(query_error)? {
                rows.push(read_row(row, column_count).map_err(query_error)?);
            }
            Ok(RunResponse {
                rows,
                changes: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB)")
            .unwrap();
        conn
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("foo"), "\"foo\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
    }

    #[test]
    fn test_run_reports_changes() {
        let conn = conn();
        let res = run_statement(
            &conn,
            &RunRequest::run(
                "INSERT INTO t (name) VALUES (?1), (?2)",
                vec![Value::text("a"), Value::text("b")],
            ),
        )
        .unwrap();
        assert_eq!(res.changes, Some(2));
        assert!(res.rows.is_empty());
    }

    #[test]
    fn test_get_returns_first_row_only() {
        let conn = conn();
        conn.execute_batch("INSERT INTO t (name) VALUES ('a'), ('b')")
            .unwrap();
        let res = run_statement(
            &conn,
            &RunRequest::new("SELECT name FROM t ORDER BY id", vec![], RunMethod::Get),
        )
        .unwrap();
        assert_eq!(res.rows, vec![vec![Value::text("a")]]);
    }

    #[test]
    fn test_get_on_empty_result_is_query_error() {
        let conn = conn();
        let err = run_statement(
            &conn,
            &RunRequest::new("SELECT name FROM t", vec![], RunMethod::Get),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
    }

    #[test]
    fn test_run_rejects_statements_returning_rows() {
        let conn = conn();
        conn.execute_batch("INSERT INTO t (name) VALUES ('a')").unwrap();

        let err = run_statement(&conn, &RunRequest::run("SELECT name FROM t", vec![])).unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));

        let err = run_statement(
            &conn,
            &RunRequest::run("INSERT INTO t (name) VALUES ('b') RETURNING id", vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
    }

    #[test]
    fn test_all_preserves_storage_classes() {
        let conn = conn();
        conn.execute(
            "INSERT INTO t (name, data) VALUES (NULL, x'0102')",
            [],
        )
        .unwrap();
        let res = run_statement(&conn, &RunRequest::all("SELECT id, name, data FROM t", vec![]))
            .unwrap();
        assert_eq!(
            res.rows,
            vec![vec![Value::Integer(1), Value::Null, Value::Blob(vec![1, 2])]]
        );
    }

    #[test]
    fn test_malformed_sql_is_query_error() {
        let conn = conn();
        let err = run_statement(&conn, &RunRequest::all("SELEC nope", vec![])).unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
    }

    #[test]
    fn test_constraint_violation_is_query_error() {
        let conn = conn();
        conn.execute_batch("INSERT INTO t (id, name) VALUES (1, 'a')")
            .unwrap();
        let err = run_statement(
            &conn,
            &RunRequest::run("INSERT INTO t (id, name) VALUES (1, 'b')", vec![]),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
    }
}
