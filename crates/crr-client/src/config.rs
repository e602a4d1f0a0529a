//! Proxy configuration.

use crr_client_sync::{RetryConfig, SessionConfig, Url};

use crate::error::ConfigError;

/// Configuration for a [`SyncProxy`](crate::SyncProxy).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Base URL of the sync server (may include a base path).
    pub server_url: Url,
    /// Name of the tracked database.
    pub db_name: String,
    /// Bearer token for signing stream URLs and submitting migrations.
    pub token: Option<String>,
    /// Reconnect policy for the change stream.
    pub retry: RetryConfig,
    /// Notices buffered per observer.
    pub notice_capacity: usize,
}

impl ProxyConfig {
    /// Validate and build a configuration with defaults.
    pub fn new(server_url: &str, db_name: impl Into<String>) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidServerUrl {
            url: server_url.to_owned(),
            reason: reason.to_owned(),
        };

        let url = Url::parse(server_url).map_err(|e| invalid(&e.to_string()))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid("scheme must be http or https"));
        }
        if url.cannot_be_a_base() {
            return Err(invalid("cannot be a base url"));
        }

        let db_name = db_name.into();
        if db_name.is_empty() {
            return Err(ConfigError::EmptyDbName);
        }
        if db_name.contains('/') {
            return Err(ConfigError::InvalidDbName(db_name));
        }

        Ok(Self {
            server_url: url,
            db_name,
            token: None,
            retry: RetryConfig::daemon(),
            notice_capacity: 64,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_notice_capacity(mut self, capacity: usize) -> Self {
        self.notice_capacity = capacity;
        self
    }

    pub(crate) fn session_config(&self) -> SessionConfig {
        SessionConfig {
            server_url: self.server_url.clone(),
            db_name: self.db_name.clone(),
            retry: self.retry.clone(),
            notice_capacity: self.notice_capacity,
        }
    }

    pub(crate) fn token(&self) -> Result<&str, ConfigError> {
        self.token.as_deref().ok_or(ConfigError::MissingToken)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_config() {
        let config = ProxyConfig::new("https://sync.example.com/api", "app")
            .unwrap()
            .with_token("t")
            .with_retry(RetryConfig::testing());
        assert_eq!(config.server_url.path(), "/api");
        assert_eq!(config.token().unwrap(), "t");
        assert_eq!(config.session_config().db_name, "app");
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            ProxyConfig::new("not a url", "app"),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
        assert!(matches!(
            ProxyConfig::new("ftp://host", "app"),
            Err(ConfigError::InvalidServerUrl { .. })
        ));
        assert_eq!(
            ProxyConfig::new("https://host", "").unwrap_err(),
            ConfigError::EmptyDbName
        );
        assert_eq!(
            ProxyConfig::new("https://host", "a/b").unwrap_err(),
            ConfigError::InvalidDbName("a/b".into())
        );
    }

    #[test]
    fn test_token_is_optional() {
        let config = ProxyConfig::new("http://localhost:6839", "app").unwrap();
        assert_eq!(config.token(), Err(ConfigError::MissingToken));
    }
}
