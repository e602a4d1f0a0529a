//! End-to-end behavior of a single replica: install, migrations, merges,
//! routing decisions and local writes.

use crr_client::core::{Changeset, Migration, RunRequest, SiteId, Value};
use crr_client::store::{MergeOutcome, MigrationOutcome, ReplicaStore, SqliteReplica, StoreError};
use crr_client::sync::{MemoryFeed, RetryConfig, StaticAuthenticator, Url};
use crr_client::{Method, ProxyConfig, ProxyRequest, SyncProxy};
use crr_client_testkit::site;

const FOO_TEXT_PK: &str = "CREATE TABLE foo(id TEXT PRIMARY KEY, bar TEXT)";

fn proxy() -> SyncProxy<SqliteReplica, StaticAuthenticator, MemoryFeed> {
    let config = ProxyConfig::new("https://sync.test", "app")
        .unwrap()
        .with_retry(RetryConfig::testing());
    SyncProxy::new(
        config,
        SqliteReplica::open_memory().unwrap(),
        StaticAuthenticator::new(),
        MemoryFeed::new(),
    )
    .unwrap()
}

fn bar_write(val: &str, col_version: i64, db_version: i64) -> Changeset {
    Changeset {
        table: "foo".into(),
        pk: Value::text("1"),
        cid: Some("bar".into()),
        val: Value::text(val),
        col_version,
        db_version,
        site_id: site(b'A'),
    }
}

#[tokio::test]
async fn fresh_install_has_no_schema() {
    let proxy = proxy();
    let version = proxy.install().await.unwrap();

    assert_eq!(version.schema_version, -1);
    assert_eq!(version.db_version, 0);
    assert_ne!(version.site_id, SiteId::from_bytes([0; 16]));
    assert!(!version.site_id.to_base64().is_empty());

    // Installing again keeps the identity.
    let again = proxy.install().await.unwrap();
    assert_eq!(again, version);
    assert_eq!(proxy.current_version().unwrap(), version);
}

#[tokio::test]
async fn migration_is_applied_once() {
    let proxy = proxy();
    proxy.install().await.unwrap();
    let migration = Migration::new(0, FOO_TEXT_PK);

    assert_eq!(
        proxy.store().apply_migration(&migration).await.unwrap(),
        MigrationOutcome::Applied { version: 0 }
    );
    assert_eq!(proxy.current_version().unwrap().schema_version, 0);

    assert_eq!(
        proxy.store().apply_migration(&migration).await.unwrap(),
        MigrationOutcome::AlreadyApplied { version: 0 }
    );
    assert_eq!(proxy.current_version().unwrap().schema_version, 0);
    assert_eq!(proxy.store().applied_migrations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn higher_column_version_wins_and_cursor_is_monotonic() {
    let proxy = proxy();
    proxy.install().await.unwrap();
    proxy
        .store()
        .apply_migration(&Migration::new(0, FOO_TEXT_PK))
        .await
        .unwrap();

    assert_eq!(
        proxy.store().apply_changeset(&bar_write("x", 1, 1)).await.unwrap(),
        MergeOutcome::Applied
    );
    assert_eq!(
        proxy.store().apply_changeset(&bar_write("y", 0, 2)).await.unwrap(),
        MergeOutcome::Stale
    );

    let rows = proxy
        .store()
        .execute(&crr_client::core::RunRequest::all(
            "SELECT bar FROM foo WHERE id = ?1",
            vec![Value::text("1")],
        ))
        .await
        .unwrap()
        .rows;
    assert_eq!(rows, vec![vec![Value::text("x")]]);
    assert_eq!(proxy.current_version().unwrap().db_version, 2);
}

#[tokio::test]
async fn migration_gap_is_rejected() {
    let proxy = proxy();
    proxy.install().await.unwrap();
    proxy
        .store()
        .apply_migration(&Migration::new(0, FOO_TEXT_PK))
        .await
        .unwrap();

    let err = proxy
        .store()
        .apply_migration(&Migration::new(2, "CREATE TABLE later (id INTEGER PRIMARY KEY)"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        StoreError::OutOfOrderMigration {
            expected: 1,
            got: 2
        }
    ));
    assert_eq!(proxy.current_version().unwrap().schema_version, 0);
}

#[tokio::test]
async fn other_databases_fall_through() {
    let proxy = proxy();
    proxy.install().await.unwrap();

    let request = |path: &str| {
        ProxyRequest::new(
            Method::POST,
            Url::parse(&format!("https://sync.test{path}")).unwrap(),
            Vec::new(),
        )
    };
    assert!(proxy.should_handle(&request("/db/app/run")));
    assert!(!proxy.should_handle(&request("/db/other/run")));
}

#[tokio::test]
async fn monotonic_across_failed_and_skipped_applies() {
    let proxy = proxy();
    proxy.install().await.unwrap();
    proxy
        .store()
        .apply_migration(&Migration::new(0, FOO_TEXT_PK))
        .await
        .unwrap();

    proxy
        .store()
        .apply_changeset(&bar_write("x", 1, 5))
        .await
        .unwrap();

    let mut unknown = bar_write("x", 1, 3);
    unknown.table = "missing".into();
    assert!(proxy.store().apply_changeset(&unknown).await.is_err());
    assert!(proxy
        .store()
        .apply_migration(&Migration::new(1, "NOT SQL"))
        .await
        .is_err());

    let version = proxy.current_version().unwrap();
    assert_eq!(version.db_version, 5);
    assert_eq!(version.schema_version, 0);
}

#[tokio::test]
async fn http_proxy_keeps_identity_on_disk() {
    use crr_client::{ConfigError, HttpSyncProxy, ProxyError};

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("app.sqlite3");
    let config = ProxyConfig::new("https://sync.test", "app").unwrap();

    assert!(matches!(
        HttpSyncProxy::open(config.clone(), &path),
        Err(ProxyError::Config(ConfigError::MissingToken))
    ));

    let config = config.with_token("secret");
    let first = {
        let proxy = HttpSyncProxy::open(config.clone(), &path).unwrap();
        proxy.install().await.unwrap()
    };
    let proxy = HttpSyncProxy::open(config, &path).unwrap();
    assert_eq!(proxy.current_version().unwrap(), first);
}

#[tokio::test]
async fn intercepted_write_is_queued_and_outranks_older_remote_writes() {
    let proxy = proxy();
    let version = proxy.install().await.unwrap();
    proxy
        .store()
        .apply_migration(&Migration::new(0, FOO_TEXT_PK))
        .await
        .unwrap();
    proxy
        .store()
        .apply_changeset(&bar_write("remote", 1, 3))
        .await
        .unwrap();

    let run = Url::parse("https://sync.test/db/app/run").unwrap();
    let update = RunRequest::run("UPDATE foo SET bar = 'local' WHERE id = '1'", vec![]);
    let request = ProxyRequest::post_json(run, &update).unwrap();
    assert!(proxy.should_handle(&request));
    assert!(proxy.respond_to(&request).await.status.is_success());

    let queued = proxy.store().local_changes().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].site_id, version.site_id);
    assert_eq!(queued[0].col_version, 2);
    assert_eq!(queued[0].val, Value::text("local"));
    // The server cursor is untouched by local writes.
    assert_eq!(proxy.current_version().unwrap().db_version, 3);

    // A concurrent remote write at the old column version loses.
    let mut concurrent = bar_write("other", 1, 4);
    concurrent.site_id = site(b'Z');
    assert_eq!(
        proxy.store().apply_changeset(&concurrent).await.unwrap(),
        MergeOutcome::Stale
    );
    let rows = proxy
        .store()
        .execute(&RunRequest::all("SELECT bar FROM foo", vec![]))
        .await
        .unwrap()
        .rows;
    assert_eq!(rows, vec![vec![Value::text("local")]]);
}
