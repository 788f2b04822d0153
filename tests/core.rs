//! Core infrastructure tests.

mod common;

use common::{minimal_config_toml, write_config};
use statebase::core::config::{Config, ConfigOverrides};
use statebase::core::error::StatebaseError;
use statebase::storage::DialectKind;
use tempfile::TempDir;

// ============================================================================
// Config tests
// ============================================================================

#[test]
fn parse_minimal_config() {
    let dir = TempDir::new().unwrap();
    let file = write_config(&minimal_config_toml(dir.path()));

    let config = Config::from_file(file.path()).unwrap();
    assert_eq!(config.listener.bind, "127.0.0.1:0");
    assert!(config.listener.insecure);
    assert_eq!(config.datastore.dialect_kind().unwrap(), DialectKind::Sqlite);
    assert_eq!(config.datastore.pool.max_open, 1);
    assert_eq!(config.compaction.retain_revisions, 1000);
    assert_eq!(config.telemetry.log_level, "info");
}

#[test]
fn parse_full_config() {
    let config = Config::from_toml(
        r#"
[listener]
bind = "0.0.0.0:2379"
tls_chain_path = "/etc/statebase/tls.crt"
tls_key_path = "/etc/statebase/tls.key"
client_ca_path = "/etc/statebase/ca.crt"
request_timeout_ms = 5000
cluster_id = 42
member_id = 3
member_name = "db-0"

[datastore]
dialect = "mysql"
endpoint = "mysql://user:secret@db:3306/statebase"

[datastore.tls]
ca_file = "/etc/mysql/ca.pem"

[datastore.pool]
max_open = 20
max_idle = 5
max_lifetime_secs = 600

[compaction]
retain_revisions = 5000

[telemetry]
log_level = "debug"
"#,
    )
    .unwrap();

    assert!(config.listener.has_tls());
    assert_eq!(config.listener.request_timeout().as_millis(), 5000);
    assert_eq!(config.listener.member_name, "db-0");
    assert_eq!(config.datastore.dialect_kind().unwrap(), DialectKind::Mysql);
    assert!(config.datastore.tls.is_enabled());
    assert_eq!(config.datastore.pool.max_idle, 5);
    assert_eq!(config.compaction.retain_revisions, 5000);
    assert_eq!(
        config.datastore.redacted_endpoint(),
        "mysql://user:***@db:3306/statebase"
    );
}

#[test]
fn validate_rejects_bad_bind() {
    let result = Config::from_toml(
        r#"
[listener]
bind = "not-an-address"

[datastore]
endpoint = "sqlite:///tmp/state.db"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("listener.bind"));
}

#[test]
fn validate_requires_tls_pair() {
    let result = Config::from_toml(
        r#"
[listener]
tls_chain_path = "/tls.crt"

[datastore]
endpoint = "sqlite:///tmp/state.db"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("tls_key_path"));
}

#[test]
fn validate_rejects_dialect_mismatch() {
    let result = Config::from_toml(
        r#"
[listener]

[datastore]
dialect = "postgres"
endpoint = "mysql://db/statebase"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn validate_rejects_unknown_scheme() {
    let result = Config::from_toml(
        r#"
[listener]

[datastore]
endpoint = "oracle://db/statebase"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("dialect"));
}

#[test]
fn validate_pool_bounds() {
    let result = Config::from_toml(
        r#"
[listener]

[datastore]
endpoint = "postgres://db/statebase"

[datastore.pool]
max_open = 2
max_idle = 4
"#,
    );
    assert!(result.unwrap_err().to_string().contains("max_idle"));
}

#[test]
fn validate_log_level() {
    let result = Config::from_toml(
        r#"
[listener]

[datastore]
endpoint = "postgres://db/statebase"

[telemetry]
log_level = "loud"
"#,
    );
    assert!(result.unwrap_err().to_string().contains("log_level"));
}

#[test]
fn config_overrides_apply() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::from_toml(&minimal_config_toml(dir.path())).unwrap();

    config.apply_overrides(&ConfigOverrides {
        log_level: Some("debug".to_string()),
        bind: Some("127.0.0.1:12379".to_string()),
        endpoint: Some("postgres://db/other".to_string()),
    });

    assert_eq!(config.telemetry.log_level, "debug");
    assert_eq!(config.listener.bind, "127.0.0.1:12379");
    assert_eq!(config.datastore.dialect_kind().unwrap(), DialectKind::Postgres);
}

// ============================================================================
// Error tests
// ============================================================================

#[test]
fn error_display() {
    let compacted = StatebaseError::Compacted {
        revision: 3,
        compact_revision: 10,
    };
    assert!(compacted.to_string().contains("compacted"));

    let future = StatebaseError::FutureRevision {
        revision: 20,
        current_revision: 10,
    };
    assert!(future.to_string().contains("future"));

    assert_eq!(
        StatebaseError::unsupported("range sort_order").to_string(),
        "range sort_order is not supported"
    );
    assert_eq!(
        StatebaseError::invalid("empty key").to_string(),
        "invalid request: empty key"
    );
}

#[test]
fn key_exists_is_identified() {
    assert!(StatebaseError::KeyExists.is_key_exists());
    assert!(!StatebaseError::internal("boom").is_key_exists());
}

// ============================================================================
// Compaction policy tests
// ============================================================================

use statebase::kv::CompactionPolicy;

#[test]
fn compaction_policy_from_config() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml(&minimal_config_toml(dir.path())).unwrap();
    let policy = CompactionPolicy::from(&config.compaction);
    assert_eq!(policy, CompactionPolicy::default());
    assert_eq!(policy.propose_target(1500, 0), Some(500));
    assert_eq!(policy.propose_target(1500, 500), None);
}

// ============================================================================
// Runtime tests
// ============================================================================

use statebase::core::runtime::{ComponentHealth, Runtime, RuntimeHealth};
use statebase::kv::Backend;

#[test]
fn runtime_health_default_is_starting() {
    let health = RuntimeHealth::default();
    assert_eq!(health.storage, ComponentHealth::Starting);
    assert_eq!(health.listeners, ComponentHealth::Starting);
    assert!(!health.is_ready());
    assert!(health.is_alive());
}

#[test]
fn runtime_health_not_alive_when_failed() {
    let health = RuntimeHealth {
        storage: ComponentHealth::Failed,
        listeners: ComponentHealth::Healthy,
    };
    assert!(!health.is_alive());
    assert!(!health.is_ready());
}

#[test]
fn runtime_rejects_invalid_config() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::from_toml(&minimal_config_toml(dir.path())).unwrap();
    config.datastore.pool.max_open = 0;
    assert!(Runtime::new(config).is_err());
}

#[tokio::test]
async fn runtime_opens_storage() {
    let dir = TempDir::new().unwrap();
    let config = Config::from_toml(&minimal_config_toml(dir.path())).unwrap();

    let mut runtime = Runtime::new(config).unwrap();
    assert!(!runtime.is_running());
    runtime.start_for_tests().await.unwrap();
    assert!(runtime.is_running());
    assert_eq!(runtime.health().storage, ComponentHealth::Healthy);

    let backend = runtime.backend().unwrap();
    assert_eq!(backend.create("k", b"v", 0).await.unwrap(), 1);

    runtime.shutdown_for_tests().await.unwrap();
    assert!(!runtime.is_running());
    assert_eq!(runtime.health().storage, ComponentHealth::Stopped);
    assert!(runtime.backend().is_none());
}

#[tokio::test]
async fn runtime_start_fails_on_unreachable_datastore() {
    let dir = TempDir::new().unwrap();
    let mut config = Config::from_toml(&minimal_config_toml(dir.path())).unwrap();
    config.datastore.endpoint = format!(
        "sqlite://{}/missing/dir/state.db",
        dir.path().display()
    );

    let mut runtime = Runtime::new(config).unwrap();
    assert!(runtime.start_for_tests().await.is_err());
    assert_eq!(runtime.health().storage, ComponentHealth::Failed);
    assert!(!runtime.is_alive());
}

// ============================================================================
// Compact command tests
// ============================================================================

use statebase::cli::commands::{run_compact, CompactArgs};
use statebase::kv::SqlLog;

#[tokio::test]
async fn compact_command_applies_retention() {
    let dir = TempDir::new().unwrap();
    let file = write_config(&minimal_config_toml(dir.path()));
    let config = Config::from_file(file.path()).unwrap();

    {
        let engine = SqlLog::open(&config.datastore).await.unwrap();
        let mut rev = engine.create("k", b"0", 0).await.unwrap();
        for i in 1..10 {
            rev = engine
                .update("k", i.to_string().as_bytes(), rev, 0)
                .await
                .unwrap()
                .revision;
        }
        engine.driver().close().await;
    }

    run_compact(
        file.path(),
        Some("warn".to_string()),
        CompactArgs {
            retain: Some(3),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let engine = SqlLog::open(&config.datastore).await.unwrap();
    assert_eq!(engine.compact_revision().await.unwrap(), 7);
    assert_eq!(engine.get("k", 0).await.unwrap().kv.unwrap().value, b"9");
    engine.driver().close().await;
}

#[tokio::test]
async fn compact_command_dry_run_changes_nothing() {
    let dir = TempDir::new().unwrap();
    let file = write_config(&minimal_config_toml(dir.path()));
    let config = Config::from_file(file.path()).unwrap();

    {
        let engine = SqlLog::open(&config.datastore).await.unwrap();
        engine.create("a", b"1", 0).await.unwrap();
        engine.create("b", b"1", 0).await.unwrap();
        engine.driver().close().await;
    }

    run_compact(
        file.path(),
        None,
        CompactArgs {
            revision: Some(2),
            retain: Some(0),
            dry_run: true,
        },
    )
    .await
    .unwrap();

    let engine = SqlLog::open(&config.datastore).await.unwrap();
    assert_eq!(engine.compact_revision().await.unwrap(), 0);
    engine.driver().close().await;
}
