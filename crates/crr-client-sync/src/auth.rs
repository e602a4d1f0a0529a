//! Authenticator: turns a stream URL into a signed, short-lived URL.
//!
//! A fresh signature is requested for every connection attempt; signed URLs
//! are never cached.

use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;

use crr_client_core::ErrorBody;

use crate::error::{Result, SyncError};
use crate::urls::signed_url_endpoint;

/// Signs stream URLs.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn sign(&self, url: &Url) -> Result<Url>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignedUrlResponse {
    signed_url: String,
}

/// Signs URLs through `GET {server}/auth/signed-url` with a bearer token.
pub struct HttpAuthenticator {
    client: reqwest::Client,
    server: Url,
    token: String,
}

impl HttpAuthenticator {
    pub fn new(server: Url, token: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), server, token)
    }

    pub fn with_client(client: reqwest::Client, server: Url, token: impl Into<String>) -> Self {
        Self {
            client,
            server,
            token: token.into(),
        }
    }
}

#[async_trait]
impl Authenticator for HttpAuthenticator {
    async fn sign(&self, url: &Url) -> Result<Url> {
        let endpoint = signed_url_endpoint(&self.server, url)?;
        let response = self
            .client
            .get(endpoint)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SyncError::Auth {
                message: error_message(response).await,
            });
        }

        let body: SignedUrlResponse = response.json().await.map_err(|e| SyncError::Auth {
            message: format!("malformed signed url response: {e}"),
        })?;
        Url::parse(&body.signed_url).map_err(|e| SyncError::Auth {
            message: format!("server returned an invalid signed url: {e}"),
        })
    }
}

/// The `{message}` of an error response, or its status line.
pub(crate) async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.to_string(),
    }
}

/// Authenticators that never touch the network.
pub mod memory {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Appends a `signature` query parameter carrying a counter, so every
    /// connection gets a distinct URL. The first `failures` calls fail.
    #[derive(Debug, Default)]
    pub struct StaticAuthenticator {
        signed: AtomicU32,
        failures: AtomicU32,
    }

    impl StaticAuthenticator {
        pub fn new() -> Self {
            Self::default()
        }

        /// Refuse the next `n` signing requests.
        pub fn failing(n: u32) -> Self {
            Self {
                signed: AtomicU32::new(0),
                failures: AtomicU32::new(n),
            }
        }

        /// Number of URLs signed so far.
        pub fn signed(&self) -> u32 {
            self.signed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Authenticator for StaticAuthenticator {
        async fn sign(&self, url: &Url) -> Result<Url> {
            let refused = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(SyncError::Auth {
                    message: "token rejected".into(),
                });
            }

            let n = self.signed.fetch_add(1, Ordering::SeqCst) + 1;
            let mut url = url.clone();
            url.query_pairs_mut().append_pair("signature", &n.to_string());
            Ok(url)
        }
    }
}
