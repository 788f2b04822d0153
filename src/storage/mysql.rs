//! MySQL dialect.

use super::dialect::{Dialect, DialectKind};
use crate::core::config::DatastoreTlsConfig;
use sqlx::error::DatabaseError;
use sqlx::mysql::MySqlDatabaseError;
use url::Url;

const ER_DB_CREATE_EXISTS: u16 = 1007;
const ER_TABLE_EXISTS: u16 = 1050;
const ER_DUP_KEYNAME: u16 = 1061;
const ER_DUP_ENTRY: u16 = 1062;

// MySQL has no CREATE INDEX IF NOT EXISTS; duplicates are filtered by
// `is_already_exists`.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS statebase (
        id BIGINT AUTO_INCREMENT,
        name VARCHAR(630) CHARACTER SET ascii COLLATE ascii_bin,
        created INTEGER,
        deleted INTEGER,
        create_revision BIGINT,
        prev_revision BIGINT,
        lease BIGINT,
        value MEDIUMBLOB,
        old_value MEDIUMBLOB,
        PRIMARY KEY (id)
    )"#,
    "CREATE INDEX statebase_name_index ON statebase (name)",
    "CREATE INDEX statebase_name_id_index ON statebase (name, id)",
    "CREATE INDEX statebase_id_deleted_index ON statebase (id, deleted)",
    "CREATE INDEX statebase_prev_revision_index ON statebase (prev_revision)",
    "CREATE UNIQUE INDEX statebase_name_prev_revision_uindex ON statebase (name, prev_revision)",
];

const COMPACT_SQL: &str = r#"
    DELETE kv FROM statebase AS kv
    INNER JOIN (
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
    ON kv.id = ks.id"#;

const SIZE_SQL: &str = r#"
    SELECT CAST(COALESCE(SUM(data_length + index_length), 0) AS SIGNED)
    FROM information_schema.TABLES
    WHERE table_schema = DATABASE() AND table_name = 'statebase'"#;

/// MySQL: `?` parameters, insert id from the result, `ascii_bin` collation.
#[derive(Debug, Clone, Copy, Default)]
pub struct MysqlDialect;

fn error_number(err: &dyn DatabaseError) -> Option<u16> {
    err.try_downcast_ref::<MySqlDatabaseError>()
        .map(|e| e.number())
}

impl Dialect for MysqlDialect {
    fn kind(&self) -> DialectKind {
        DialectKind::Mysql
    }

    fn schema(&self) -> &'static [&'static str] {
        SCHEMA
    }

    fn compact_sql(&self) -> &'static str {
        COMPACT_SQL
    }

    fn size_sql(&self) -> &'static str {
        SIZE_SQL
    }

    fn is_unique_violation(&self, err: &dyn DatabaseError) -> bool {
        match error_number(err) {
            Some(number) => number == ER_DUP_ENTRY,
            None => err.is_unique_violation(),
        }
    }

    fn is_already_exists(&self, err: &dyn DatabaseError) -> bool {
        matches!(
            error_number(err),
            Some(ER_DB_CREATE_EXISTS) | Some(ER_TABLE_EXISTS) | Some(ER_DUP_KEYNAME)
        )
    }

    fn apply_tls(&self, url: &mut Url, tls: &DatastoreTlsConfig) {
        if !tls.is_enabled() {
            return;
        }
        let mut pairs = url.query_pairs_mut();
        let mode = if tls.ca_file.is_some() {
            "VERIFY_IDENTITY"
        } else {
            "REQUIRED"
        };
        pairs.append_pair("ssl-mode", mode);
        if let Some(ref ca) = tls.ca_file {
            pairs.append_pair("ssl-ca", ca);
        }
        if let Some(ref cert) = tls.cert_file {
            pairs.append_pair("ssl-cert", cert);
        }
        if let Some(ref key) = tls.key_file {
            pairs.append_pair("ssl-key", key);
        }
    }

    fn admin_url(&self, url: &Url) -> Option<Url> {
        let mut admin = url.clone();
        admin.set_path("/");
        Some(admin)
    }

    fn database_exists_sql(&self) -> &'static str {
        "SELECT COUNT(*) FROM information_schema.SCHEMATA WHERE SCHEMA_NAME = ?"
    }

    fn create_database_sql(&self, name: &str) -> String {
        format!("CREATE DATABASE IF NOT EXISTS `{}`", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders_unchanged() {
        let sql = "SELECT ? FROM statebase WHERE id = ?";
        assert_eq!(MysqlDialect.rewrite(sql), sql);
    }

    #[test]
    fn test_tls_without_ca_requires_encryption() {
        let mut url = Url::parse("mysql://u:p@db:3306/statebase").unwrap();
        let tls = DatastoreTlsConfig {
            ca_file: None,
            cert_file: Some("/etc/client.pem".to_string()),
            key_file: Some("/etc/client-key.pem".to_string()),
        };
        MysqlDialect.apply_tls(&mut url, &tls);

        let query = url.query().unwrap();
        assert!(query.contains("ssl-mode=REQUIRED"));
        assert!(query.contains("ssl-cert="));
        assert!(!query.contains("ssl-ca="));
    }

    #[test]
    fn test_create_database_quotes_name() {
        assert_eq!(
            MysqlDialect.create_database_sql("statebase"),
            "CREATE DATABASE IF NOT EXISTS `statebase`"
        );
    }
}
