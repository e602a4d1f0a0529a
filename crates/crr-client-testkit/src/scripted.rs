//! A scripted sync server.
//!
//! [`ScriptedServer`] plays both collaborators of a sync session: it signs
//! URLs like the auth endpoint and serves the change stream like the server,
//! resuming from the `db_version` and `schema_version` in the requested URL.
//! Events appended while a stream is open are pushed to it live.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;

use crr_client_core::{Changeset, Migration, SiteId, Value};
use crr_client_sync::{
    Authenticator, ChangeFeed, EventStream, RawEvent, Result, ServerEvent, SyncError, Url,
};

/// Query parameter the server's signature lives in.
pub const SIGNATURE_PARAM: &str = "crr-url-hash";

#[derive(Default)]
struct ServerState {
    log: Vec<ServerEvent>,
    db_version: i64,
    migrations: i64,
    disconnect_every: Option<usize>,
    refuse: usize,
    pending_error: Option<String>,
    signed: usize,
    opened: Vec<Url>,
    live: Vec<mpsc::UnboundedSender<Result<RawEvent>>>,
}

impl ServerState {
    fn append(&mut self, event: ServerEvent) -> Result<()> {
        let raw = event.encode()?;
        self.live
            .retain(|tx| tx.unbounded_send(Ok(raw.clone())).is_ok());
        self.log.push(event);
        Ok(())
    }
}

/// In-memory server with a migration and change log.
#[derive(Clone, Default)]
pub struct ScriptedServer {
    state: Arc<Mutex<ServerState>>,
}

impl ScriptedServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append the next migration. Returns its version.
    pub fn migrate(&self, sql: &str) -> Result<i64> {
        let mut state = self.lock();
        let version = state.migrations;
        state.migrations += 1;
        state.append(ServerEvent::Migration(Migration::new(version, sql)))?;
        Ok(version)
    }

    /// Append a column write, stamped with the next server `db_version`.
    pub fn write(
        &self,
        site_id: SiteId,
        table: &str,
        pk: i64,
        column: Option<&str>,
        val: impl Into<Value>,
        col_version: i64,
    ) -> Result<Changeset> {
        let mut state = self.lock();
        state.db_version += 1;
        let changeset = Changeset {
            table: table.into(),
            pk: Value::Integer(pk),
            cid: column.map(String::from),
            val: val.into(),
            col_version,
            db_version: state.db_version,
            site_id,
        };
        state.append(ServerEvent::Change(changeset.clone()))?;
        Ok(changeset)
    }

    /// Append a changeset exactly as given.
    pub fn push_change(&self, changeset: Changeset) -> Result<()> {
        let mut state = self.lock();
        state.db_version = state.db_version.max(changeset.db_version);
        state.append(ServerEvent::Change(changeset))
    }

    /// Drop every connection after `n` backlog events.
    pub fn disconnect_every(&self, n: usize) {
        self.lock().disconnect_every = Some(n.max(1));
    }

    /// Refuse the next `n` connection attempts.
    pub fn refuse_connections(&self, n: usize) {
        self.lock().refuse = n;
    }

    /// Open the next connection with an `error` event instead of the backlog.
    pub fn fail_next_with(&self, message: impl Into<String>) {
        self.lock().pending_error = Some(message.into());
    }

    /// URLs the feed was opened with, in order.
    pub fn opened(&self) -> Vec<Url> {
        self.lock().opened.clone()
    }

    /// How many URLs were signed.
    pub fn signed(&self) -> usize {
        self.lock().signed
    }

    /// The server's current `db_version`.
    pub fn db_version(&self) -> i64 {
        self.lock().db_version
    }
}

fn query_i64(url: &Url, key: &str, default: i64) -> Result<i64> {
    match url.query_pairs().find(|(k, _)| k == key) {
        None => Ok(default),
        Some((_, v)) => v
            .parse()
            .map_err(|_| SyncError::Transport(format!("400: bad {key} {v:?}"))),
    }
}

#[async_trait]
impl Authenticator for ScriptedServer {
    async fn sign(&self, url: &Url) -> Result<Url> {
        let mut state = self.lock();
        state.signed += 1;
        let mut signed = url.clone();
        signed
            .query_pairs_mut()
            .append_pair(SIGNATURE_PARAM, &state.signed.to_string());
        Ok(signed)
    }
}

#[async_trait]
impl ChangeFeed for ScriptedServer {
    async fn open(&self, url: &Url) -> Result<EventStream> {
        let mut state = self.lock();
        state.opened.push(url.clone());

        if !url.query_pairs().any(|(k, _)| k == SIGNATURE_PARAM) {
            return Err(SyncError::Auth {
                message: "unsigned url".into(),
            });
        }
        if state.refuse > 0 {
            state.refuse -= 1;
            return Err(SyncError::Transport("connection refused".into()));
        }
        if let Some(message) = state.pending_error.take() {
            let raw = ServerEvent::Error { message }.encode()?;
            return Ok(futures::stream::iter([Ok(raw)]).boxed());
        }

        let db_version = query_i64(url, "db_version", 0)?;
        let schema_version = query_i64(url, "schema_version", -1)?;

        let backlog = state
            .log
            .iter()
            .filter(|event| match event {
                ServerEvent::Migration(m) => m.version > schema_version,
                ServerEvent::Change(c) => c.db_version > db_version,
                ServerEvent::Error { .. } => false,
            })
            .map(ServerEvent::encode)
            .collect::<Result<Vec<_>>>()?;

        if let Some(n) = state.disconnect_every {
            if backlog.len() > n {
                let events: Vec<Result<RawEvent>> = backlog
                    .into_iter()
                    .take(n)
                    .map(Ok)
                    .chain([Err(SyncError::Transport("connection dropped".into()))])
                    .collect();
                return Ok(futures::stream::iter(events).boxed());
            }
        }

        let (tx, rx) = mpsc::unbounded();
        state.live.push(tx);
        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(rx)
            .boxed())
    }
}
