//! SyncProxy: the composition root.
//!
//! Owns one replica and wires it to the change stream and to the request
//! interceptor.

use std::sync::Arc;

use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crr_client_core::VersionState;
use crr_client_store::{ReplicaStore, SqliteReplica, StoreError};
use crr_client_sync::{
    Authenticator, ChangeFeed, HaltLatch, HttpAuthenticator, HttpChangeFeed, SessionReport,
    SessionState, ShutdownHandle, SyncError, SyncNotice, SyncSession,
};

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::interceptor::{ProxyRequest, ProxyResponse, RequestInterceptor};
use crate::submit::{HttpChangeUploader, HttpMigrationSubmitter};

/// A proxy talking to a real server over HTTP.
pub type HttpSyncProxy = SyncProxy<SqliteReplica, HttpAuthenticator, HttpChangeFeed>;

struct ActiveSession {
    shutdown: ShutdownHandle,
    task: JoinHandle<std::result::Result<SessionReport, SyncError>>,
}

/// Client replica synchronization proxy for one tracked database.
pub struct SyncProxy<S: ReplicaStore, A: Authenticator, F: ChangeFeed> {
    config: ProxyConfig,
    store: Arc<S>,
    auth: Arc<A>,
    feed: Arc<F>,
    interceptor: RequestInterceptor<S>,
    halt: HaltLatch,
    state: Arc<watch::Sender<SessionState>>,
    notices: broadcast::Sender<SyncNotice>,
    session: Mutex<Option<ActiveSession>>,
}

impl HttpSyncProxy {
    /// Open the replica at `path` and talk to the configured server.
    ///
    /// Requires a token in `config`.
    pub fn open(config: ProxyConfig, path: impl AsRef<std::path::Path>) -> Result<Self> {
        let token = config.token()?.to_owned();
        let store = SqliteReplica::open(path)?;
        let auth = HttpAuthenticator::new(config.server_url.clone(), token);
        Self::new(config, store, auth, HttpChangeFeed::new())
    }
}

impl<S, A, F> SyncProxy<S, A, F>
where
    S: ReplicaStore + 'static,
    A: Authenticator + 'static,
    F: ChangeFeed + 'static,
{
    pub fn new(config: ProxyConfig, store: S, auth: A, feed: F) -> Result<Self> {
        let store = Arc::new(store);
        let interceptor =
            RequestInterceptor::new(store.clone(), &config.server_url, &config.db_name)?;
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));

        Ok(Self {
            config,
            store,
            auth: Arc::new(auth),
            feed: Arc::new(feed),
            interceptor,
            halt: HaltLatch::new(),
            state: Arc::new(state),
            notices,
            session: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Create bookkeeping and the site id if absent. Idempotent.
    pub async fn install(&self) -> Result<VersionState> {
        let version = self.store.install().await?;
        tracing::info!(
            db = %self.config.db_name,
            site_id = %version.site_id,
            schema_version = version.schema_version,
            db_version = version.db_version,
            "replica installed"
        );
        Ok(version)
    }

    /// Start syncing in the background.
    ///
    /// # Errors
    /// - `NotInstalled` if `install` has not run.
    /// - `AlreadyActive` if a session is still running.
    /// - The error a previous session stopped on, if it was never collected
    ///   by `close`. The next call starts a new session.
    pub async fn activate(&self) -> Result<()> {
        self.current_version()?;

        let mut session = self.session.lock().await;
        if let Some(active) = session.take() {
            if !active.task.is_finished() {
                *session = Some(active);
                return Err(ProxyError::AlreadyActive);
            }
            if let Err(e) = active.task.await.map_err(session_task_failed)? {
                tracing::warn!(db = %self.config.db_name, error = %e, "previous sync session failed");
                return Err(ProxyError::Sync(e));
            }
        }

        let sync = SyncSession::new(
            self.store.clone(),
            self.auth.clone(),
            self.feed.clone(),
            self.config.session_config(),
        )
        .with_halt_latch(self.halt.clone())
        .with_state_sender(self.state.clone())
        .with_notice_sender(self.notices.clone());

        let shutdown = sync.shutdown_handle();
        let task = tokio::spawn(sync.run());
        *session = Some(ActiveSession { shutdown, task });

        tracing::info!(db = %self.config.db_name, "sync activated");
        Ok(())
    }

    /// Stop syncing and wait for the session to wind down.
    ///
    /// Returns the session report, or `None` if no session was started.
    /// A session that already stopped on a fatal error returns that error.
    pub async fn close(&self) -> Result<Option<SessionReport>> {
        let Some(active) = self.session.lock().await.take() else {
            return Ok(None);
        };

        active.shutdown.shutdown();
        let outcome = active.task.await.map_err(session_task_failed)?;
        Ok(Some(outcome?))
    }

    /// Whether this request should be answered locally.
    pub fn should_handle(&self, request: &ProxyRequest) -> bool {
        self.interceptor.should_handle(request)
    }

    /// Answer a request from the local replica.
    pub async fn respond_to(&self, request: &ProxyRequest) -> ProxyResponse {
        self.interceptor.respond_to(request).await
    }

    /// Snapshot of the replica's version state.
    pub fn current_version(&self) -> Result<VersionState> {
        self.store.current_version().map_err(|e| match e {
            StoreError::NotInstalled => ProxyError::NotInstalled,
            e => ProxyError::Store(e),
        })
    }

    /// Observe session notices.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    /// Observe session state.
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Whether a failed migration halted the replica.
    pub fn is_halted(&self) -> bool {
        self.halt.is_halted()
    }

    /// Clear the halt after the replica has been repaired.
    pub fn reset_halt(&self) {
        self.halt.reset();
    }

    /// Submit migrations to the server. They reach this replica through the
    /// change stream once the server has applied them.
    pub async fn submit_migrations(&self, queries: &[String]) -> Result<()> {
        let submitter = HttpMigrationSubmitter::new(
            &self.config.server_url,
            &self.config.db_name,
            self.config.token()?,
        )?;
        submitter.submit(queries).await
    }

    /// Upload local writes the server has not acknowledged yet.
    ///
    /// Returns the number of changes uploaded. On failure nothing is marked
    /// uploaded and the next call sends the same changes again.
    pub async fn upload_changes(&self) -> Result<usize> {
        let uploader = HttpChangeUploader::new(
            &self.config.server_url,
            &self.config.db_name,
            self.config.token()?,
        )?;

        let changes = self.store.local_changes().await?;
        let Some(last) = changes.iter().map(|c| c.db_version).max() else {
            return Ok(0);
        };

        uploader.upload(&changes).await?;
        self.store.acknowledge_upload(last).await?;
        tracing::debug!(db = %self.config.db_name, last, "local changes acknowledged");
        Ok(changes.len())
    }
}

fn session_task_failed(e: tokio::task::JoinError) -> ProxyError {
    ProxyError::Sync(SyncError::Transport(format!("session task failed: {e}")))
}
