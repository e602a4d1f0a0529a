//! Body shapes of the query execution endpoint.
//!
//! The interceptor answers with exactly these shapes so callers cannot tell
//! a locally served request from a remote one.

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// How the caller wants the statement's result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMethod {
    /// Execute and report affected rows.
    Run,
    /// First row only.
    Get,
    /// Rows as positional arrays.
    Values,
    /// Every row. Unknown methods behave like `all`.
    #[default]
    #[serde(other)]
    All,
}

/// `POST /db/<name>/run` request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub method: RunMethod,
}

impl RunRequest {
    pub fn new(sql: impl Into<String>, params: Vec<Value>, method: RunMethod) -> Self {
        Self {
            sql: sql.into(),
            params,
            method,
        }
    }

    /// A statement whose rows the caller wants.
    pub fn all(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(sql, params, RunMethod::All)
    }

    /// A statement executed for its side effects.
    pub fn run(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self::new(sql, params, RunMethod::Run)
    }
}

/// Successful response body.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunResponse {
    pub rows: Vec<Vec<Value>>,
    pub changes: Option<usize>,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
