//! Server-sent events on the change stream.
//!
//! The server emits three named events, each carrying a JSON payload:
//!
//! | event       | data                                   |
//! |-------------|----------------------------------------|
//! | `change`    | a [`Changeset`]                        |
//! | `migration` | a [`Migration`]                        |
//! | `error`     | `{"message": "..."}`                   |
//!
//! Any other event name is ignored.

use crr_client_core::{Changeset, ErrorBody, Migration};

use crate::error::{Result, SyncError};

/// Event names on the change stream.
pub mod names {
    pub const CHANGE: &str = "change";
    pub const MIGRATION: &str = "migration";
    pub const ERROR: &str = "error";
}

/// One event as it arrives off the wire, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub event: String,
    pub data: String,
}

impl RawEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            data: data.into(),
        }
    }
}

/// A decoded server event.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    Change(Changeset),
    Migration(Migration),
    Error { message: String },
}

impl ServerEvent {
    /// Decode a raw event.
    ///
    /// Returns `Ok(None)` for event names this client does not know.
    pub fn decode(raw: &RawEvent) -> Result<Option<Self>> {
        let event = match raw.event.as_str() {
            names::CHANGE => ServerEvent::Change(parse(raw)?),
            names::MIGRATION => ServerEvent::Migration(parse(raw)?),
            names::ERROR => {
                let body: ErrorBody = parse(raw)?;
                ServerEvent::Error {
                    message: body.message,
                }
            }
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    /// Encode into the wire form the server would send.
    pub fn encode(&self) -> Result<RawEvent> {
        let (name, data) = match self {
            ServerEvent::Change(c) => (names::CHANGE, serde_json::to_string(c)),
            ServerEvent::Migration(m) => (names::MIGRATION, serde_json::to_string(m)),
            ServerEvent::Error { message } => {
                (names::ERROR, serde_json::to_string(&ErrorBody::new(message.clone())))
            }
        };
        let data = data.map_err(|e| SyncError::InvalidEvent(e.to_string()))?;
        Ok(RawEvent::new(name, data))
    }
}

fn parse<T: serde::de::DeserializeOwned>(raw: &RawEvent) -> Result<T> {
    serde_json::from_str(&raw.data)
        .map_err(|e| SyncError::InvalidEvent(format!("{} event: {e}", raw.event)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crr_client_core::{SiteId, Value};

    #[test]
    fn test_decode_change() {
        let site = SiteId::from_bytes([1; 16]);
        let raw = RawEvent::new(
            "change",
            format!(
                r#"{{"table":"foo","pk":"1","cid":"bar","val":"x","col_version":1,"db_version":3,"site_id":"{}"}}"#,
                site.to_base64()
            ),
        );
        let Some(ServerEvent::Change(c)) = ServerEvent::decode(&raw).unwrap() else {
            panic!("expected change");
        };
        assert_eq!(c.table, "foo");
        assert_eq!(c.pk, Value::text("1"));
        assert_eq!(c.cid.as_deref(), Some("bar"));
        assert_eq!(c.db_version, 3);
        assert_eq!(c.site_id, site);
    }

    #[test]
    fn test_decode_tombstone_with_null_cid() {
        let raw = RawEvent::new(
            "change",
            format!(
                r#"{{"table":"foo","pk":1,"cid":null,"val":null,"col_version":2,"db_version":4,"site_id":"{}"}}"#,
                SiteId::ZERO.to_base64()
            ),
        );
        let Some(ServerEvent::Change(c)) = ServerEvent::decode(&raw).unwrap() else {
            panic!("expected change");
        };
        assert!(c.is_tombstone());
    }

    #[test]
    fn test_decode_migration_and_error() {
        let raw = RawEvent::new("migration", r#"{"version":0,"sql":"CREATE TABLE foo (id)"}"#);
        assert_eq!(
            ServerEvent::decode(&raw).unwrap(),
            Some(ServerEvent::Migration(Migration::new(0, "CREATE TABLE foo (id)")))
        );

        let raw = RawEvent::new("error", r#"{"message":"database not found"}"#);
        assert_eq!(
            ServerEvent::decode(&raw).unwrap(),
            Some(ServerEvent::Error {
                message: "database not found".into()
            })
        );
    }

    #[test]
    fn test_unknown_events_are_ignored() {
        let raw = RawEvent::new("ping", "whatever");
        assert_eq!(ServerEvent::decode(&raw).unwrap(), None);
    }

    #[test]
    fn test_garbage_is_invalid() {
        let raw = RawEvent::new("change", "{not json");
        assert!(matches!(
            ServerEvent::decode(&raw),
            Err(SyncError::InvalidEvent(_))
        ));
    }

    #[test]
    fn test_encode_decodes_back() {
        let event = ServerEvent::Migration(Migration::new(3, "ALTER TABLE foo ADD COLUMN baz"));
        let raw = event.encode().unwrap();
        assert_eq!(raw.event, "migration");
        assert_eq!(ServerEvent::decode(&raw).unwrap(), Some(event));
    }
}
