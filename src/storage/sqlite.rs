//! SQLite dialect, for single-node deployments and tests.

use super::dialect::{Dialect, DialectKind};
use crate::core::config::DatastoreTlsConfig;
use sqlx::error::DatabaseError;
use url::Url;

// AUTOINCREMENT keeps ids from being reused after compaction removes the
// highest row.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS statebase (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT,
        created INTEGER,
        deleted INTEGER,
        create_revision INTEGER,
        prev_revision INTEGER,
        lease INTEGER,
        value BLOB,
        old_value BLOB
    )"#,
    "CREATE INDEX IF NOT EXISTS statebase_name_index ON statebase (name)",
    "CREATE INDEX IF NOT EXISTS statebase_name_id_index ON statebase (name, id)",
    "CREATE INDEX IF NOT EXISTS statebase_id_deleted_index ON statebase (id, deleted)",
    "CREATE INDEX IF NOT EXISTS statebase_prev_revision_index ON statebase (prev_revision)",
    "CREATE UNIQUE INDEX IF NOT EXISTS statebase_name_prev_revision_uindex ON statebase (name, prev_revision)",
];

const COMPACT_SQL: &str = r#"
    DELETE FROM statebase
    WHERE id IN (
        SELECT kp.prev_revision
        FROM statebase AS kp
        WHERE kp.name != 'compact_rev_key'
            AND kp.prev_revision != 0
            AND kp.id <= ?
        UNION
        SELECT kd.id
        FROM statebase AS kd
        WHERE kd.deleted != 0
            AND kd.id <= ?
    )"#;

/// SQLite: `?` parameters, `RETURNING` insert ids, BINARY collation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Sqlite
    }

    fn schema(&self) -> &'static [&'static str] {
        SCHEMA
    }

    fn compact_sql(&self) -> &'static str {
        COMPACT_SQL
    }

    fn size_sql(&self) -> &'static str {
        "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()"
    }

    // The Any driver does not surface the rowid as a last insert id.
    fn insert_returning(&self) -> Option<&'static str> {
        Some(" RETURNING id")
    }

    // A second writer on the same file fails with SQLITE_BUSY instead of
    // waiting, so writers queue on the pool.
    fn max_connections(&self) -> Option<u32> {
        Some(1)
    }

    fn is_unique_violation(&self, err: &dyn DatabaseError) -> bool {
        err.is_unique_violation()
    }

    fn is_already_exists(&self, err: &dyn DatabaseError) -> bool {
        err.message().contains("already exists")
    }

    fn apply_tls(&self, _url: &mut Url, tls: &DatastoreTlsConfig) {
        if tls.is_enabled() {
            tracing::warn!("datastore.tls is ignored for sqlite");
        }
    }

    fn prepare_url(&self, url: &mut Url) {
        with_create_mode(url);
    }

    fn admin_url(&self, _url: &Url) -> Option<Url> {
        None
    }

    fn database_exists_sql(&self) -> &'static str {
        "SELECT 1"
    }

    fn create_database_sql(&self, _name: &str) -> String {
        String::new()
    }
}

/// Make sure a file-backed SQLite DSN creates its file on first open.
pub fn with_create_mode(url: &mut Url) {
    let has_mode = url.query_pairs().any(|(k, _)| k == "mode");
    if !has_mode && !url.path().contains(":memory:") {
        url.query_pairs_mut().append_pair("mode", "rwc");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_mode_added_once() {
        let mut url = Url::parse("sqlite:///tmp/state.db").unwrap();
        with_create_mode(&mut url);
        with_create_mode(&mut url);
        assert_eq!(url.query(), Some("mode=rwc"));
    }

    #[test]
    fn test_create_mode_respects_existing() {
        let mut url = Url::parse("sqlite:///tmp/state.db?mode=ro").unwrap();
        with_create_mode(&mut url);
        assert_eq!(url.query(), Some("mode=ro"));
    }

    #[test]
    fn test_no_admin_database() {
        let url = Url::parse("sqlite:///tmp/state.db").unwrap();
        assert!(SqliteDialect.admin_url(&url).is_none());
    }
}
