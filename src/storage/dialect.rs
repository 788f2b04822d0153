//! SQL dialect abstraction.
//!
//! Each supported database supplies its schema, the statements whose syntax
//! differs between engines, and the error codes the engine must recognise.
//! Shared statement templates live in [`super::generic`] and are written with
//! `?` placeholders; dialects that number their parameters rewrite them.

use crate::core::config::DatastoreTlsConfig;
use serde::{Deserialize, Serialize};
use sqlx::error::DatabaseError;
use std::fmt;
use std::sync::Arc;
use url::Url;

/// Table holding every revision of every key.
pub const TABLE_NAME: &str = "statebase";

/// Reserved key whose `prev_revision` column stores the compaction watermark.
pub const COMPACT_REV_KEY: &str = "compact_rev_key";

/// Supported SQL engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialectKind {
    Mysql,
    Postgres,
    Sqlite,
}

impl DialectKind {
    /// Infer the dialect from a DSN scheme.
    pub fn from_endpoint(endpoint: &str) -> Option<Self> {
        let scheme = endpoint.split(':').next()?.to_ascii_lowercase();
        match scheme.as_str() {
            "mysql" | "mariadb" => Some(Self::Mysql),
            "postgres" | "postgresql" => Some(Self::Postgres),
            "sqlite" => Some(Self::Sqlite),
            _ => None,
        }
    }

    /// Build the dialect implementation for this kind.
    pub fn dialect(self) -> Arc<dyn Dialect> {
        match self {
            Self::Mysql => Arc::new(super::mysql::MysqlDialect),
            Self::Postgres => Arc::new(super::postgres::PostgresDialect),
            Self::Sqlite => Arc::new(super::sqlite::SqliteDialect),
        }
    }
}

impl fmt::Display for DialectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mysql => write!(f, "mysql"),
            Self::Postgres => write!(f, "postgres"),
            Self::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Engine-specific SQL and error recognition.
pub trait Dialect: Send + Sync + fmt::Debug {
    /// Which engine this is.
    fn kind(&self) -> DialectKind;

    /// Rewrite `?` placeholders into the engine's parameter syntax.
    fn rewrite(&self, sql: &str) -> String {
        sql.to_string()
    }

    /// Table and index creation statements, run in order at startup.
    fn schema(&self) -> &'static [&'static str];

    /// Deletes superseded rows and tombstones up to a target revision.
    ///
    /// Binds the target revision twice.
    fn compact_sql(&self) -> &'static str;

    /// Returns the on-disk size of the table in bytes as a single BIGINT.
    fn size_sql(&self) -> &'static str;

    /// Appended to the insert statement when the engine returns the new id
    /// as a row instead of through the query result.
    fn insert_returning(&self) -> Option<&'static str> {
        None
    }

    /// Upper bound on pooled connections, for engines that lock the whole
    /// database for each writer.
    fn max_connections(&self) -> Option<u32> {
        None
    }

    /// First statement of a read-only transaction, if the engine needs one
    /// for snapshot reads.
    fn read_only_statement(&self) -> Option<&'static str> {
        None
    }

    /// Whether a database error is a unique-index violation.
    fn is_unique_violation(&self, err: &dyn DatabaseError) -> bool;

    /// Whether a schema or database creation error means the object is
    /// already present.
    fn is_already_exists(&self, err: &dyn DatabaseError) -> bool;

    /// Add client TLS parameters to the DSN.
    fn apply_tls(&self, url: &mut Url, tls: &DatastoreTlsConfig);

    /// Engine-specific DSN adjustments applied before connecting.
    fn prepare_url(&self, _url: &mut Url) {}

    /// Connection URL for the administrative database used to create the
    /// target database, or `None` when the engine creates it on connect.
    fn admin_url(&self, url: &Url) -> Option<Url>;

    /// Counts catalog entries for a database name bound as the only
    /// parameter.
    fn database_exists_sql(&self) -> &'static str;

    /// Statement creating the named database.
    fn create_database_sql(&self, name: &str) -> String;
}

/// Replace each `?` with a numbered `$N` parameter.
pub fn number_placeholders(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len() + 8);
    let mut n = 0;
    for c in sql.chars() {
        if c == '?' {
            n += 1;
            out.push('$');
            out.push_str(&n.to_string());
        } else {
            out.push(c);
        }
    }
    out
}

/// Database name from a DSN path, if it is safe to use as an identifier.
pub fn database_name(url: &Url) -> Option<String> {
    let name = url.path().trim_start_matches('/');
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    valid.then(|| name.to_string())
}
