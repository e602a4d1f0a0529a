//! Endpoint URLs on the sync server.
//!
//! The server URL may carry a base path (`https://host/api`); endpoints are
//! appended below it.

use reqwest::Url;

use crr_client_core::VersionState;

use crate::error::{Result, SyncError};

/// `{server}/{segments...}` with any query or fragment on `server` dropped.
pub fn endpoint(server: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = server.clone();
    url.set_query(None);
    url.set_fragment(None);
    url.path_segments_mut()
        .map_err(|_| SyncError::InvalidUrl(format!("{server} cannot be a base url")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// The change stream of `db_name`, resuming after `version`.
pub fn changes_url(server: &Url, db_name: &str, version: &VersionState) -> Result<Url> {
    let mut url = endpoint(server, &["db", db_name, "changes"])?;
    url.query_pairs_mut()
        .append_pair("site_id", &version.site_id.to_base64())
        .append_pair("db_version", &version.db_version.to_string())
        .append_pair("schema_version", &version.schema_version.to_string());
    Ok(url)
}

/// The auth endpoint that signs `url`.
pub fn signed_url_endpoint(server: &Url, url: &Url) -> Result<Url> {
    let mut endpoint = endpoint(server, &["auth", "signed-url"])?;
    endpoint.query_pairs_mut().append_pair("url", url.as_str());
    Ok(endpoint)
}

/// The remote query endpoint of `db_name`.
pub fn run_url(server: &Url, db_name: &str) -> Result<Url> {
    endpoint(server, &["db", db_name, "run"])
}

/// The migration submission endpoint of `db_name`.
pub fn migrate_url(server: &Url, db_name: &str) -> Result<Url> {
    endpoint(server, &["db", db_name, "migrate"])
}

/// Where local changes of `db_name` are uploaded. Same path as the stream.
pub fn upload_url(server: &Url, db_name: &str) -> Result<Url> {
    endpoint(server, &["db", db_name, "changes"])
}
