//! ChangeFeed: opens the server-sent event stream of a database.
//!
//! Implementations yield raw events in arrival order. Decoding and dispatch
//! belong to the session.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::stream::{BoxStream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{StatusCode, Url};

use crate::auth::error_message;
use crate::error::{Result, SyncError};
use crate::messages::RawEvent;

/// An open change stream. Ends when the server closes the connection.
pub type EventStream = BoxStream<'static, Result<RawEvent>>;

/// Opens change streams.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Connect to a (signed) stream URL.
    async fn open(&self, url: &Url) -> Result<EventStream>;
}

/// Change feed over HTTP server-sent events.
#[derive(Debug, Clone, Default)]
pub struct HttpChangeFeed {
    client: reqwest::Client,
}

impl HttpChangeFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn open(&self, url: &Url) -> Result<EventStream> {
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(SyncError::Auth {
                message: error_message(response).await,
            });
        }
        if !status.is_success() {
            let message = error_message(response).await;
            return Err(SyncError::Transport(format!("{status}: {message}")));
        }

        tracing::debug!(%status, "change stream open");

        let events = response.bytes_stream().eventsource().map(|event| match event {
            Ok(event) => Ok(RawEvent::new(event.event, event.data)),
            Err(e) => Err(SyncError::Transport(e.to_string())),
        });
        Ok(events.boxed())
    }
}

/// A scripted in-memory feed for testing.
///
/// Each call to `open` consumes the next scripted connection.
pub mod memory {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// One scripted connection.
    #[derive(Debug, Default)]
    pub struct ScriptedConnection {
        refuse: Option<String>,
        events: Vec<Result<RawEvent>>,
        hold_open: bool,
    }

    impl ScriptedConnection {
        pub fn new() -> Self {
            Self::default()
        }

        /// A connection attempt that fails before any event.
        pub fn refused(message: impl Into<String>) -> Self {
            Self {
                refuse: Some(message.into()),
                ..Self::default()
            }
        }

        pub fn event(mut self, event: RawEvent) -> Self {
            self.events.push(Ok(event));
            self
        }

        pub fn events(mut self, events: impl IntoIterator<Item = RawEvent>) -> Self {
            self.events.extend(events.into_iter().map(Ok));
            self
        }

        /// Drop the connection with a transport error at this point.
        pub fn fail(mut self, message: impl Into<String>) -> Self {
            self.events.push(Err(SyncError::Transport(message.into())));
            self
        }

        /// Keep the stream open after the last event instead of closing it.
        pub fn hold_open(mut self) -> Self {
            self.hold_open = true;
            self
        }
    }

    /// Feed that replays scripted connections and records requested URLs.
    #[derive(Debug, Default)]
    pub struct MemoryFeed {
        connections: Mutex<VecDeque<ScriptedConnection>>,
        opened: Mutex<Vec<Url>>,
    }

    impl MemoryFeed {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push(&self, connection: ScriptedConnection) {
            lock(&self.connections).push_back(connection);
        }

        /// URLs passed to `open`, in order.
        pub fn opened(&self) -> Vec<Url> {
            lock(&self.opened).clone()
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[async_trait]
    impl ChangeFeed for MemoryFeed {
        async fn open(&self, url: &Url) -> Result<EventStream> {
            lock(&self.opened).push(url.clone());

            let connection = lock(&self.connections)
                .pop_front()
                .ok_or_else(|| SyncError::Transport("connection refused".into()))?;

            if let Some(message) = connection.refuse {
                return Err(SyncError::Transport(message));
            }

            let events = futures::stream::iter(connection.events);
            if connection.hold_open {
                Ok(events.chain(futures::stream::pending()).boxed())
            } else {
                Ok(events.boxed())
            }
        }
    }
}
