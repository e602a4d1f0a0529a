//! # CRR Client Core
//!
//! Pure data types for the CRR client: version state, changesets,
//! migrations and the JSON wire values shared with the server.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`VersionState`] - `{site_id, schema_version, db_version}` of one replica
//! - [`SiteId`] - Fixed-length identity of a writer replica
//! - [`Changeset`] - A single-column delta tagged with its logical clock
//! - [`Migration`] - An ordered schema statement issued by the server
//! - [`Clock`] - The `(col_version, site_id)` pair ordered for last-writer-wins
//! - [`Value`] - A SQLite scalar as it travels over JSON
//! - [`RunRequest`] / [`RunResponse`] - The query execution endpoint's body shapes

pub mod changeset;
pub mod error;
pub mod types;
pub mod value;
pub mod version;
pub mod wire;

pub use changeset::{Changeset, Clock, Migration, DELETE_SENTINEL};
pub use error::CoreError;
pub use types::SiteId;
pub use value::Value;
pub use version::{MigrationOrder, VersionState, NO_SCHEMA};
pub use wire::{ErrorBody, RunMethod, RunRequest, RunResponse};
