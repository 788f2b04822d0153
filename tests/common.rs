//! Common test utilities.
//!
//! This module contains shared helpers for integration tests.
//! Import with `mod common;` in test files.

#![allow(dead_code)]

use statebase::core::config::{DatastoreConfig, DatastoreTlsConfig, PoolConfig};
use statebase::kv::SqlLog;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tempfile::{NamedTempFile, TempDir};

/// A SQLite-backed engine living in a temporary directory.
///
/// Keep the struct alive for the duration of the test; dropping it removes
/// the database file.
pub struct TestStore {
    pub dir: TempDir,
    pub engine: Arc<SqlLog>,
}

/// SQLite datastore config for a file inside `dir`.
pub fn sqlite_datastore(dir: &Path) -> DatastoreConfig {
    DatastoreConfig {
        dialect: None,
        endpoint: sqlite_endpoint(dir),
        create_database: true,
        tls: DatastoreTlsConfig::default(),
        pool: PoolConfig {
            max_open: 1,
            max_idle: 1,
            max_lifetime_secs: 0,
            idle_timeout_secs: 0,
            acquire_timeout_secs: 30,
        },
    }
}

/// SQLite endpoint for a database file inside `dir`.
pub fn sqlite_endpoint(dir: &Path) -> String {
    format!("sqlite://{}/state.db", dir.display())
}

/// Open a fresh engine on an empty database.
pub async fn open_store() -> TestStore {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let engine = SqlLog::open(&sqlite_datastore(dir.path()))
        .await
        .expect("Failed to open sqlite datastore");
    TestStore {
        dir,
        engine: Arc::new(engine),
    }
}

/// Minimal valid configuration pointing at a SQLite file in `dir`.
pub fn minimal_config_toml(dir: &Path) -> String {
    format!(
        r#"
[listener]
bind = "127.0.0.1:0"
insecure = true

[datastore]
endpoint = "{}"

[datastore.pool]
max_open = 1
max_idle = 1
"#,
        sqlite_endpoint(dir)
    )
}

/// Write configuration text to a temporary file.
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("Failed to create temp file");
    file.write_all(content.as_bytes())
        .expect("Failed to write config");
    file
}
