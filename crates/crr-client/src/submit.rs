//! Migration submission and local change upload.
//!
//! Submitted migrations are not applied locally. The server assigns them
//! versions and they come back through the change stream like any other.
//! Uploaded changes are already applied locally; the server relays them to
//! the other replicas.

use serde::Serialize;

use crr_client_core::{Changeset, ErrorBody};
use crr_client_sync::{urls, Url};

use crate::error::{ProxyError, Result};

#[derive(Serialize)]
struct MigrateBody<'a> {
    queries: &'a [String],
}

/// POST `body` as JSON with bearer auth; any non-2xx is a server error.
async fn post_json<T: Serialize + ?Sized>(
    client: &reqwest::Client,
    endpoint: &Url,
    token: &str,
    body: &T,
) -> Result<()> {
    let response = client
        .post(endpoint.clone())
        .bearer_auth(token)
        .json(body)
        .send()
        .await
        .map_err(crr_client_sync::SyncError::from)?;

    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    };
    Err(ProxyError::Server {
        status: status.as_u16(),
        message,
    })
}

/// Posts migrations to `{server}/db/<db>/migrate`.
pub struct HttpMigrationSubmitter {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl HttpMigrationSubmitter {
    pub fn new(server_url: &Url, db_name: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: urls::migrate_url(server_url, db_name)?,
            token: token.into(),
        })
    }

    pub async fn submit(&self, queries: &[String]) -> Result<()> {
        post_json(
            &self.client,
            &self.endpoint,
            &self.token,
            &MigrateBody { queries },
        )
        .await?;
        tracing::info!(count = queries.len(), "submitted migrations");
        Ok(())
    }
}

/// Posts local changes to `{server}/db/<db>/changes` as a JSON array.
pub struct HttpChangeUploader {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl HttpChangeUploader {
    pub fn new(server_url: &Url, db_name: &str, token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            endpoint: urls::upload_url(server_url, db_name)?,
            token: token.into(),
        })
    }

    pub async fn upload(&self, changes: &[Changeset]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        post_json(&self.client, &self.endpoint, &self.token, changes).await?;
        tracing::info!(count = changes.len(), "uploaded local changes");
        Ok(())
    }
}
