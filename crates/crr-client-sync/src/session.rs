//! Sync session: keeps one replica attached to its change stream.
//!
//! ```text
//!            +--------------+   sign + open   +-----------+
//!   start -> |  Connecting  | --------------> | Streaming |
//!            +--------------+                 +-----------+
//!                  ^                                |
//!                  | delay elapsed       close/error|
//!            +--------------+                 +--------------+
//!            |   Backoff    | <-------------- | Disconnected |
//!            +--------------+                 +--------------+
//!
//!   shutdown or fatal error from any state -> Closed
//! ```
//!
//! Events are applied strictly in arrival order; each apply completes
//! before the next event is read. Shutdown is observed at every suspension
//! point except an apply in progress.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Url;
use tokio::sync::{broadcast, watch};

use crr_client_store::{MigrationOutcome, ReplicaStore, StoreError};

use crate::appliers::{BatchReport, ChangesetApplier, HaltLatch, MigrationApplier};
use crate::auth::Authenticator;
use crate::error::{Result, SyncError};
use crate::feed::ChangeFeed;
use crate::messages::ServerEvent;
use crate::retry::RetryConfig;
use crate::urls::changes_url;

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Streaming,
    /// Waiting `delay` before connection attempt number `attempt + 1`.
    Backoff { attempt: u32, delay: Duration },
    Closed,
}

/// Observer-facing events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncNotice {
    /// A change stream opened at this version.
    Connected { schema_version: i64, db_version: i64 },
    /// A migration was applied.
    MigrationApplied { version: i64 },
    /// The server or the session reported an error.
    Error { message: String },
}

/// Configuration for a sync session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the sync server.
    pub server_url: Url,
    /// Name of the tracked database.
    pub db_name: String,
    /// Reconnect policy.
    pub retry: RetryConfig,
    /// Notices buffered per slow observer before it starts missing some.
    pub notice_capacity: usize,
}

impl SessionConfig {
    pub fn new(server_url: Url, db_name: impl Into<String>) -> Self {
        Self {
            server_url,
            db_name: db_name.into(),
            retry: RetryConfig::default(),
            notice_capacity: 64,
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// What a session did before it ended.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Streams successfully opened.
    pub connections: usize,
    /// Migrations applied (redeliveries not counted).
    pub migrations_applied: usize,
    /// Changeset outcomes.
    pub changesets: BatchReport,
    /// Non-fatal errors that caused a reconnect.
    pub errors: usize,
}

/// Requests shutdown of a running session.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<watch::Sender<bool>>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.0.borrow()
    }
}

enum StreamEnd {
    /// The server closed the stream.
    Closed,
    Shutdown,
}

/// A sync session for one replica.
pub struct SyncSession<S: ReplicaStore, A: Authenticator, F: ChangeFeed> {
    store: Arc<S>,
    auth: Arc<A>,
    feed: Arc<F>,
    config: SessionConfig,
    migrations: MigrationApplier<S>,
    changes: ChangesetApplier<S>,
    state: Arc<watch::Sender<SessionState>>,
    notices: broadcast::Sender<SyncNotice>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown: watch::Receiver<bool>,
}

impl<S, A, F> SyncSession<S, A, F>
where
    S: ReplicaStore + 'static,
    A: Authenticator + 'static,
    F: ChangeFeed + 'static,
{
    pub fn new(store: Arc<S>, auth: Arc<A>, feed: Arc<F>, config: SessionConfig) -> Self {
        let halt = HaltLatch::new();
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (notices, _) = broadcast::channel(config.notice_capacity.max(1));
        let (shutdown_tx, shutdown) = watch::channel(false);

        Self {
            migrations: MigrationApplier::new(store.clone(), halt.clone()),
            changes: ChangesetApplier::new(store.clone(), halt),
            store,
            auth,
            feed,
            config,
            state: Arc::new(state),
            notices,
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown,
        }
    }

    /// Share a halt latch that outlives this session.
    pub fn with_halt_latch(mut self, halt: HaltLatch) -> Self {
        self.migrations = MigrationApplier::new(self.store.clone(), halt.clone());
        self.changes = ChangesetApplier::new(self.store.clone(), halt);
        self
    }

    /// Publish state changes through an existing channel.
    pub fn with_state_sender(mut self, state: Arc<watch::Sender<SessionState>>) -> Self {
        self.state = state;
        self
    }

    /// Publish notices through an existing channel.
    pub fn with_notice_sender(mut self, notices: broadcast::Sender<SyncNotice>) -> Self {
        self.notices = notices;
        self
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncNotice> {
        self.notices.subscribe()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shutdown_tx.clone())
    }

    /// Run until shutdown or a fatal error.
    ///
    /// # Errors
    /// - `RetriesExhausted` after too many consecutive failed connections.
    /// - Any fatal apply error (`MigrationFailed`, `OutOfOrderMigration`,
    ///   storage errors, `ReplicaHalted`).
    pub async fn run(mut self) -> Result<SessionReport> {
        let mut report = SessionReport::default();
        let mut failures: u32 = 0;

        let outcome = loop {
            if *self.shutdown.borrow() {
                break Ok(());
            }
            self.set_state(SessionState::Connecting);

            match self.connect_and_stream(&mut report, &mut failures).await {
                Ok(StreamEnd::Shutdown) => break Ok(()),
                Ok(StreamEnd::Closed) => {
                    tracing::info!(db = %self.config.db_name, "change stream closed by server");
                }
                Err(e) if e.is_fatal() => {
                    self.notify(SyncNotice::Error {
                        message: e.to_string(),
                    });
                    break Err(e);
                }
                Err(e) => {
                    report.errors += 1;
                    tracing::warn!(db = %self.config.db_name, error = %e, "sync connection failed");
                }
            }

            self.set_state(SessionState::Disconnected);

            failures += 1;
            if self.config.retry.exhausted(failures) {
                break Err(SyncError::RetriesExhausted { attempts: failures });
            }

            let delay = self.config.retry.delay_for_attempt(failures - 1);
            self.set_state(SessionState::Backoff {
                attempt: failures,
                delay,
            });
            tracing::debug!(attempt = failures, ?delay, "backing off");

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.set_state(SessionState::Closed);
        match outcome {
            Ok(()) => {
                tracing::info!(?report, "sync session closed");
                Ok(report)
            }
            Err(e) => {
                tracing::error!(error = %e, "sync session stopped");
                Err(e)
            }
        }
    }

    async fn connect_and_stream(
        &mut self,
        report: &mut SessionReport,
        failures: &mut u32,
    ) -> Result<StreamEnd> {
        let version = self.store.current_version()?;
        let url = changes_url(&self.config.server_url, &self.config.db_name, &version)?;

        let signed = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Ok(StreamEnd::Shutdown),
            signed = self.auth.sign(&url) => signed?,
        };

        let mut events = tokio::select! {
            biased;
            _ = shutdown_requested(&mut self.shutdown) => return Ok(StreamEnd::Shutdown),
            opened = self.feed.open(&signed) => opened?,
        };

        *failures = 0;
        report.connections += 1;
        self.set_state(SessionState::Streaming);
        self.notify(SyncNotice::Connected {
            schema_version: version.schema_version,
            db_version: version.db_version,
        });
        tracing::info!(
            db = %self.config.db_name,
            schema_version = version.schema_version,
            db_version = version.db_version,
            "change stream connected"
        );

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => return Ok(StreamEnd::Shutdown),
                next = events.next() => next,
            };

            let raw = match next {
                Some(raw) => raw?,
                None => return Ok(StreamEnd::Closed),
            };

            let event = match ServerEvent::decode(&raw) {
                Ok(Some(event)) => event,
                Ok(None) => {
                    tracing::trace!(event = %raw.event, "ignoring unknown event");
                    continue;
                }
                Err(e) => {
                    self.notify(SyncNotice::Error {
                        message: e.to_string(),
                    });
                    return Err(e);
                }
            };

            self.dispatch(event, report).await?;
        }
    }

    async fn dispatch(&self, event: ServerEvent, report: &mut SessionReport) -> Result<()> {
        match event {
            ServerEvent::Migration(migration) => {
                match self.migrations.apply(&migration).await? {
                    MigrationOutcome::Applied { version } => {
                        report.migrations_applied += 1;
                        self.notify(SyncNotice::MigrationApplied { version });
                    }
                    MigrationOutcome::AlreadyApplied { version } => {
                        tracing::debug!(version, "migration redelivered");
                    }
                }
            }
            ServerEvent::Change(changeset) => match self.changes.apply(&changeset).await {
                Ok(outcome) => report.changesets.record(outcome),
                Err(SyncError::Store(StoreError::InvalidChangeset { table, reason })) => {
                    tracing::warn!(%table, %reason, db_version = changeset.db_version, "skipping invalid changeset");
                    report.changesets.invalid += 1;
                }
                Err(e) => return Err(e),
            },
            ServerEvent::Error { message } => {
                self.notify(SyncNotice::Error {
                    message: message.clone(),
                });
                return Err(SyncError::Stream { message });
            }
        }
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    fn notify(&self, notice: SyncNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A closed channel counts as a request.
    let _ = shutdown.wait_for(|stop| *stop).await;
}
