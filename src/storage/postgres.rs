//! PostgreSQL dialect.

use super::dialect::{number_placeholders, Dialect, DialectKind};
use crate::core::config::DatastoreTlsConfig;
use sqlx::error::DatabaseError;
use url::Url;

const UNIQUE_VIOLATION: &str = "23505";
const DUPLICATE_TABLE: &str = "42P07";
const DUPLICATE_DATABASE: &str = "42P04";

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS statebase (
        id BIGSERIAL PRIMARY KEY,
        name VARCHAR(630) COLLATE "C",
        created INTEGER,
        deleted INTEGER,
        create_revision BIGINT,
        prev_revision BIGINT,
        lease BIGINT,
        value BYTEA,
        old_value BYTEA
    )"#,
    "CREATE INDEX IF NOT EXISTS statebase_name_index ON statebase (name)",
    "CREATE INDEX IF NOT EXISTS statebase_name_id_index ON statebase (name, id)",
    "CREATE INDEX IF NOT EXISTS statebase_id_deleted_index ON statebase (id, deleted)",
    "CREATE INDEX IF NOT EXISTS statebase_prev_revision_index ON statebase (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS statebase_name_prev_revision_uindex ON statebase (name, prev_revision)",
];

const COMPACT_SQL: &str = r#"
    DELETE FROM statebase AS kv
    USING (
        SELECT kp.prev_revision AS id
        FROM statebase AS kp
        WHERE kp.name != 'compact_rev_key'
            AND kp.prev_revision != 0
            AND kp.id <= ?
        UNION
        SELECT kd.id AS id
        FROM statebase AS kd
        WHERE kd.deleted != 0
            AND kd.id <= ?
    ) AS ks
    WHERE kv.id = ks.id"#;

/// PostgreSQL: `$N` parameters, `RETURNING id`, byte-ordered `"C"` collation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Postgres
    }

    fn rewrite(&self, sql: &str) -> String {
        number_placeholders(sql)
    }

    fn schema(&self) -> &'static [&'static str] {
        SCHEMA
    }

    fn compact_sql(&self) -> &'static str {
        COMPACT_SQL
    }

    fn size_sql(&self) -> &'static str {
        "SELECT pg_total_relation_size('statebase')::BIGINT"
    }

    fn insert_returning(&self) -> Option<&'static str> {
        Some(" RETURNING id")
    }

    fn read_only_statement(&self) -> Option<&'static str> {
        Some("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
    }

    fn is_unique_violation(&self, err: &dyn DatabaseError) -> bool {
        err.code().as_deref() == Some(UNIQUE_VIOLATION)
    }

    fn is_already_exists(&self, err: &dyn DatabaseError) -> bool {
        // Concurrent CREATE ... IF NOT EXISTS can still trip the catalog's
        // own unique index.
        matches!(
            err.code().as_deref(),
            Some(DUPLICATE_TABLE) | Some(DUPLICATE_DATABASE) | Some(UNIQUE_VIOLATION)
        )
    }

    fn apply_tls(&self, url: &mut Url, tls: &DatastoreTlsConfig) {
        if !tls.is_enabled() {
            return;
        }
        let mut pairs = url.query_pairs_mut();
        let mode = if tls.ca_file.is_some() {
            "verify-full"
        } else {
            "require"
        };
        pairs.append_pair("sslmode", mode);
        if let Some(ref ca) = tls.ca_file {
            pairs.append_pair("sslrootcert", ca);
        }
        if let Some(ref cert) = tls.cert_file {
            pairs.append_pair("sslcert", cert);
        }
        if let Some(ref key) = tls.key_file {
            pairs.append_pair("sslkey", key);
        }
    }

    fn admin_url(&self, url: &Url) -> Option<Url> {
        let mut admin = url.clone();
        admin.set_path("/postgres");
        Some(admin)
    }

    fn database_exists_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM pg_database WHERE datname = ?"
    }

    fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE \"{}\"", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_parameters() {
        let mut url = Url::parse("postgres://u:p@db:5432/statebase").unwrap();
        let tls = DatastoreTlsConfig {
            ca_file: Some("/etc/ca.pem".to_string()),
            cert_file: Some("/etc/client.pem".to_string()),
            key_file: Some("/etc/client-key.pem".to_string()),
        };
        PostgresDialect.apply_tls(&mut url, &tls);

        let query = url.query().unwrap();
        assert!(query.contains("sslmode=verify-full"));
        assert!(query.contains("sslrootcert=%2Fetc%2Fca.pem"));
        assert!(query.contains("sslkey="));
    }

    #[test]
    fn test_admin_url_targets_postgres_database() {
        let url = Url::parse("postgres://u:p@db:5432/statebase?sslmode=disable").unwrap();
        let admin = PostgresDialect.admin_url(&url).unwrap();
        assert_eq!(admin.path(), "/postgres");
        assert_eq!(admin.query(), Some("sslmode=disable"));
    }

    #[test]
    fn test_compact_sql_numbered() {
        let sql = PostgresDialect.rewrite(PostgresDialect.compact_sql());
        assert!(sql.contains("kp.id <= $1"));
        assert!(sql.contains("kd.id <= $2"));
        assert!(!sql.contains('?'));
    }
}
