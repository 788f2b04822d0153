//! Connection pool, statement templates and startup shared by every dialect.
//!
//! [`Generic`] is built once at startup and passed down explicitly; there is
//! no process-wide pool. Startup is: apply TLS to the DSN, make sure the
//! database exists, connect the pool, create the schema.

use super::dialect::{database_name, Dialect, DialectKind, COMPACT_REV_KEY, TABLE_NAME};
use super::tx::Transaction;
use crate::core::config::{DatastoreConfig, PoolConfig};
use crate::core::error::{StatebaseError, StatebaseResult};
use sqlx::any::AnyPoolOptions;
use sqlx::{AnyConnection, AnyPool};
use sqlx::{Connection, Executor};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const COLUMNS: &str = "kv.id AS theid, kv.name AS thename, kv.created, kv.deleted, \
    kv.create_revision, kv.prev_revision, kv.lease, kv.value, kv.old_value";

/// Which keys a list statement scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFilter<'a> {
    /// A single key.
    Exact(&'a str),
    /// `start <= name < end`, or `start < name < end` when exclusive.
    Range(KeyRange<'a>),
}

/// Half-open key range over byte-ordered names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyRange<'a> {
    pub start: &'a str,
    pub start_exclusive: bool,
    pub end: &'a str,
}

/// Transaction options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TxOptions {
    /// Run as a read-only snapshot.
    pub read_only: bool,
}

impl TxOptions {
    /// Options for a read-only snapshot transaction.
    pub fn read_only() -> Self {
        Self { read_only: true }
    }
}

/// Statement text after placeholder rewriting.
#[derive(Debug)]
pub(crate) struct Templates {
    pub current_revision: String,
    pub compact_revision: String,
    pub get_revision: String,
    pub list_exact: String,
    pub list_range: String,
    pub list_range_after: String,
    pub count_range: String,
    pub count_range_after: String,
    pub insert: String,
    pub insert_returns_id: bool,
    pub update_compact: String,
    pub delete_stale_compact: String,
    pub compact: String,
    pub delete_revision: String,
    pub size: String,
}

fn revision_sql() -> String {
    format!("SELECT COALESCE(MAX(rkv.id), 0) FROM {TABLE_NAME} AS rkv")
}

/// Id of the newest watermark row.
///
/// Wrapped in a derived table so MySQL accepts it inside an `UPDATE` or
/// `DELETE` on the same table.
fn compact_row_id_sql() -> String {
    format!(
        "SELECT w.id FROM (SELECT MAX(wkv.id) AS id FROM {TABLE_NAME} AS wkv \
         WHERE wkv.name = '{COMPACT_REV_KEY}') AS w"
    )
}

fn compact_revision_sql() -> String {
    format!(
        "SELECT COALESCE(MAX(crkv.prev_revision), 0) FROM {TABLE_NAME} AS crkv \
         WHERE crkv.name = '{COMPACT_REV_KEY}'"
    )
}

/// Latest row per key matching `filter` at or below a revision.
///
/// Parameters: the filter's, then the revision, then include-deleted.
fn list_sql(filter: &str) -> String {
    format!(
        r#"
        SELECT ({rev}) AS current_revision, ({compact}) AS compact_revision, {COLUMNS}
        FROM {TABLE_NAME} AS kv
        JOIN (
            SELECT MAX(mkv.id) AS id
            FROM {TABLE_NAME} AS mkv
            WHERE {filter}
                AND mkv.name != '{COMPACT_REV_KEY}'
                AND mkv.id <= ?
            GROUP BY mkv.name
        ) AS maxkv ON maxkv.id = kv.id
        WHERE kv.deleted = 0 OR ?
        ORDER BY kv.name ASC"#,
        rev = revision_sql(),
        compact = compact_revision_sql(),
    )
}

fn count_sql(filter: &str) -> String {
    format!(
        "SELECT ({rev}) AS current_revision, COUNT(c.theid) FROM ({list}) AS c",
        rev = revision_sql(),
        list = list_sql(filter),
    )
}

impl Templates {
    fn new(dialect: &dyn Dialect) -> Self {
        let insert = format!(
            "INSERT INTO {TABLE_NAME} (name, created, deleted, create_revision, prev_revision, \
             lease, value, old_value) VALUES (?, ?, ?, ?, ?, ?, ?, ?){}",
            dialect.insert_returning().unwrap_or("")
        );

        let range = "mkv.name >= ? AND mkv.name < ?";
        let range_after = "mkv.name > ? AND mkv.name < ?";

        Self {
            current_revision: revision_sql(),
            compact_revision: compact_revision_sql(),
            get_revision: dialect.rewrite(&format!(
                "SELECT 0, 0, {COLUMNS} FROM {TABLE_NAME} AS kv WHERE kv.id = ?"
            )),
            list_exact: dialect.rewrite(&list_sql("mkv.name = ?")),
            list_range: dialect.rewrite(&list_sql(range)),
            list_range_after: dialect.rewrite(&list_sql(range_after)),
            count_range: dialect.rewrite(&count_sql(range)),
            count_range_after: dialect.rewrite(&count_sql(range_after)),
            insert: dialect.rewrite(&insert),
            insert_returns_id: dialect.insert_returning().is_some(),
            update_compact: dialect.rewrite(&format!(
                "UPDATE {TABLE_NAME} SET prev_revision = ? \
                 WHERE name = '{COMPACT_REV_KEY}' AND id = ({})",
                compact_row_id_sql()
            )),
            delete_stale_compact: format!(
                "DELETE FROM {TABLE_NAME} WHERE name = '{COMPACT_REV_KEY}' AND id < ({})",
                compact_row_id_sql()
            ),
            compact: dialect.rewrite(dialect.compact_sql()),
            delete_revision: dialect.rewrite(&format!("DELETE FROM {TABLE_NAME} WHERE id = ?")),
            size: dialect.size_sql().to_string(),
        }
    }
}

/// SQL driver for one dialect: pool, templates and error translation.
#[derive(Debug)]
pub struct Generic {
    pool: AnyPool,
    dialect: Arc<dyn Dialect>,
    pub(crate) sql: Templates,
}

impl Generic {
    /// Connect, creating the database and schema when needed.
    ///
    /// Any failure here is fatal to the caller: the bridge cannot serve
    /// without a working schema.
    pub async fn open(config: &DatastoreConfig) -> StatebaseResult<Self> {
        sqlx::any::install_default_drivers();

        let kind = config
            .dialect_kind()
            .map_err(|e| StatebaseError::invalid(e.to_string()))?;
        let dialect = kind.dialect();

        let mut url = Url::parse(&config.endpoint)
            .map_err(|e| StatebaseError::invalid(format!("invalid datastore endpoint: {}", e)))?;
        dialect.apply_tls(&mut url, &config.tls);
        dialect.prepare_url(&mut url);

        if config.create_database {
            ensure_database(dialect.as_ref(), &url).await;
        }

        tracing::info!(
            dialect = %kind,
            endpoint = %config.redacted_endpoint(),
            max_open = config.pool.max_open,
            "connecting to datastore"
        );
        let pool = pool_options(&config.pool, dialect.max_connections())
            .connect(url.as_str())
            .await?;

        let driver = Self::new(pool, dialect);
        driver.migrate().await?;
        Ok(driver)
    }

    /// Wrap an existing pool.
    pub fn new(pool: AnyPool, dialect: Arc<dyn Dialect>) -> Self {
        let sql = Templates::new(dialect.as_ref());
        Self { pool, dialect, sql }
    }

    /// The dialect in use.
    pub fn kind(&self) -> DialectKind {
        self.dialect.kind()
    }

    /// The underlying pool.
    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    /// Create the table and indexes, tolerating ones that already exist.
    pub async fn migrate(&self) -> StatebaseResult<()> {
        for statement in self.dialect.schema() {
            match self.pool.execute(*statement).await {
                Ok(_) => {}
                Err(sqlx::Error::Database(err)) if self.dialect.is_already_exists(err.as_ref()) => {
                    tracing::debug!(error = %err, "schema object already exists");
                }
                Err(err) => return Err(err.into()),
            }
        }
        tracing::debug!(dialect = %self.kind(), "schema ready");
        Ok(())
    }

    /// Begin a transaction.
    pub async fn begin_tx(&self, opts: TxOptions) -> StatebaseResult<Transaction<'_>> {
        let mut inner = self.pool.begin().await?;
        if opts.read_only {
            if let Some(statement) = self.dialect.read_only_statement() {
                (&mut *inner).execute(statement).await?;
            }
        }
        Ok(Transaction::new(inner, self))
    }

    /// Map unique-index violations to [`StatebaseError::KeyExists`]; pass
    /// everything else through.
    pub fn translate_err(&self, err: sqlx::Error) -> StatebaseError {
        if let sqlx::Error::Database(ref db_err) = err {
            if self.dialect.is_unique_violation(db_err.as_ref()) {
                return StatebaseError::KeyExists;
            }
        }
        StatebaseError::Database(err)
    }

    /// Size of the table on disk in bytes.
    pub async fn size(&self) -> StatebaseResult<i64> {
        let size = sqlx::query_scalar::<_, i64>(&self.sql.size)
            .fetch_one(&self.pool)
            .await?;
        Ok(size)
    }

    /// Close every pooled connection.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn nonzero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn pool_options(pool: &PoolConfig, limit: Option<u32>) -> AnyPoolOptions {
    let max_open = match limit {
        Some(limit) if limit < pool.max_open => {
            tracing::info!(
                configured = pool.max_open,
                max_open = limit,
                "dialect limits datastore pool size"
            );
            limit
        }
        _ => pool.max_open,
    };
    AnyPoolOptions::new()
        .max_connections(max_open)
        .min_connections(pool.max_idle.min(max_open))
        .acquire_timeout(Duration::from_secs(pool.acquire_timeout_secs))
        .max_lifetime(nonzero_secs(pool.max_lifetime_secs))
        .idle_timeout(nonzero_secs(pool.idle_timeout_secs))
}

/// Create the target database if the dialect supports it and it is missing.
///
/// Failures are logged and swallowed: the role may lack `CREATE DATABASE`
/// while the database already exists, and a real absence surfaces when the
/// pool connects.
async fn ensure_database(dialect: &dyn Dialect, url: &Url) {
    let Some(admin) = dialect.admin_url(url) else {
        return;
    };
    let Some(name) = database_name(url) else {
        tracing::debug!("endpoint names no database; skipping creation");
        return;
    };
    if let Err(err) = create_database(dialect, &admin, &name).await {
        tracing::warn!(database = %name, error = %err, "could not ensure database exists");
    }
}

async fn create_database(dialect: &dyn Dialect, admin: &Url, name: &str) -> Result<(), sqlx::Error> {
    let mut conn = AnyConnection::connect(admin.as_str()).await?;

    let exists_sql = dialect.rewrite(dialect.database_exists_sql());
    let exists: i64 = sqlx::query_scalar(&exists_sql)
        .bind(name)
        .fetch_one(&mut conn)
        .await?;

    if exists == 0 {
        let create_sql = dialect.create_database_sql(name);
        match conn.execute(create_sql.as_str()).await {
            Ok(_) => tracing::info!(database = %name, "created database"),
            Err(sqlx::Error::Database(err)) if dialect.is_already_exists(err.as_ref()) => {}
            Err(err) => return Err(err),
        }
    }

    conn.close().await
}
