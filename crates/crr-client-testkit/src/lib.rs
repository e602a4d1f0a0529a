//! # CRR Client Testkit
//!
//! Testing utilities for the CRR client.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: replicas with a schema, changeset builders
//! - **Generators**: Proptest strategies for change histories
//! - **Scripted server**: an in-memory sync server that signs URLs and
//!   serves a resumable change stream
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use crr_client_testkit::generators::foo_history_and_permutation;
//!
//! proptest! {
//!     #[test]
//!     fn converges((history, shuffled) in foo_history_and_permutation(30)) {
//!         // apply both to separate replicas and compare digests
//!     }
//! }
//! ```
//!
//! ## Scripted Server
//!
//! ```rust
//! use crr_client_testkit::{fixtures::{site, FOO_TABLE}, ScriptedServer};
//!
//! let server = ScriptedServer::new();
//! server.migrate(FOO_TABLE).unwrap();
//! server.write(site(1), "foo", 1, Some("bar"), "hello", 1).unwrap();
//! assert_eq!(server.db_version(), 1);
//! ```

pub mod fixtures;
pub mod generators;
pub mod scripted;

pub use fixtures::{
    delete_foo, foo_rows, installed_replica, mail_rows, replica_with_schema, set_foo, site,
    FOO_TABLE, MAIL_TABLE,
};
pub use generators::{
    foo_change, foo_history, foo_history_and_permutation, mail_change, mail_history,
    mail_history_and_permutation, site_id, value,
};
pub use scripted::{ScriptedServer, SIGNATURE_PARAM};
