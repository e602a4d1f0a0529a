//! RequestInterceptor: answers the tracked database's query endpoint from
//! the local replica.
//!
//! A matching request is `POST {server}/db/<db>/run` on the server's origin.
//! The response has the same shape as the remote endpoint: `200 {rows,
//! changes}` on success, a non-2xx status with `{message}` on failure.

use std::sync::Arc;

use reqwest::{Method, StatusCode};
use serde::Serialize;

use crr_client_core::{ErrorBody, RunRequest};
use crr_client_store::{ReplicaStore, StoreError};
use crr_client_sync::{urls, Url};

use crate::error::Result;

/// An outbound request as seen by the interceptor.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    pub url: Url,
    pub body: Vec<u8>,
}

impl ProxyRequest {
    pub fn new(method: Method, url: Url, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method,
            url,
            body: body.into(),
        }
    }

    /// A `POST` with a JSON body.
    pub fn post_json<T: Serialize>(url: Url, body: &T) -> serde_json::Result<Self> {
        Ok(Self::new(Method::POST, url, serde_json::to_vec(body)?))
    }
}

/// A locally produced response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
}

impl ProxyResponse {
    pub const CONTENT_TYPE: &'static str = "application/json";

    fn json<T: Serialize>(status: StatusCode, body: &T) -> Self {
        match serde_json::to_vec(body) {
            Ok(body) => Self { status, body },
            Err(e) => Self::error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
        }
    }

    fn error(status: StatusCode, message: impl Into<String>) -> Self {
        // ErrorBody always serializes.
        let body = serde_json::to_vec(&ErrorBody::new(message)).unwrap_or_default();
        Self { status, body }
    }

    /// Decode the body.
    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

/// Serves the tracked database's `run` endpoint from the replica.
pub struct RequestInterceptor<S: ReplicaStore> {
    store: Arc<S>,
    run_url: Url,
}

impl<S: ReplicaStore> RequestInterceptor<S> {
    pub fn new(store: Arc<S>, server_url: &Url, db_name: &str) -> Result<Self> {
        Ok(Self {
            store,
            run_url: urls::run_url(server_url, db_name)?,
        })
    }

    /// Whether `request` targets the tracked database's query endpoint.
    pub fn should_handle(&self, request: &ProxyRequest) -> bool {
        request.method == Method::POST
            && request.url.origin() == self.run_url.origin()
            && request.url.path() == self.run_url.path()
    }

    /// Execute the request against the replica.
    pub async fn respond_to(&self, request: &ProxyRequest) -> ProxyResponse {
        let run: RunRequest = match serde_json::from_slice(&request.body) {
            Ok(run) => run,
            Err(e) => {
                return ProxyResponse::error(
                    StatusCode::BAD_REQUEST,
                    format!("invalid request body: {e}"),
                )
            }
        };

        match self.store.execute(&run).await {
            Ok(response) => ProxyResponse::json(StatusCode::OK, &response),
            Err(e @ StoreError::Query { .. }) => {
                tracing::debug!(error = %e, "intercepted query failed");
                ProxyResponse::error(StatusCode::BAD_REQUEST, e.to_string())
            }
            Err(e) => {
                tracing::warn!(error = %e, "replica unavailable for intercepted query");
                ProxyResponse::error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
            }
        }
    }
}
