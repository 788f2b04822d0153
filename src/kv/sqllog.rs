//! Log-structured key-value engine over SQL.
//!
//! Every mutation appends one row; its auto-increment id is the new revision.
//! Rows of one key chain through `prev_revision`, and the unique index on
//! `(name, prev_revision)` turns each insert into a compare-and-swap: only
//! the writer that names the true current row as predecessor can insert.
//!
//! ```text
//!   id  name  created deleted prev  value
//!    1  foo      1       0      0   bar     Create
//!    2  foo      0       0      1   baz     Update(expected=1)
//!    3  foo      0       1      2   baz     Delete(expected=2)
//!    4  foo      1       0      3   new     Create again
//! ```

use super::backend::{Backend, CompactResult, GetResult, KeyValue, ListResult, WriteOutcome};
use crate::core::config::DatastoreConfig;
use crate::core::error::{StatebaseError, StatebaseResult};
use crate::storage::{
    Generic, KeyFilter, KeyRange, ListQuery, NewRow, Row, RowFlags, Transaction, TxOptions,
    COMPACT_REV_KEY,
};
use async_trait::async_trait;

/// Longest key the schema can store.
pub const MAX_KEY_LEN: usize = 630;

impl From<&Row> for KeyValue {
    fn from(row: &Row) -> Self {
        Self {
            key: row.name.clone(),
            create_revision: row.effective_create_revision(),
            mod_revision: row.id,
            value: row.value.clone(),
            lease: row.lease,
        }
    }
}

/// SQL-backed implementation of [`Backend`].
#[derive(Debug)]
pub struct SqlLog {
    driver: Generic,
}

impl SqlLog {
    /// Wrap an opened driver.
    pub fn new(driver: Generic) -> Self {
        Self { driver }
    }

    /// Open the datastore described by `config`.
    pub async fn open(config: &DatastoreConfig) -> StatebaseResult<Self> {
        Ok(Self::new(Generic::open(config).await?))
    }

    /// The SQL driver.
    pub fn driver(&self) -> &Generic {
        &self.driver
    }

    /// Current compaction watermark.
    pub async fn compact_revision(&self) -> StatebaseResult<i64> {
        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = tx.get_compact_revision().await;
        finish(tx, result).await
    }

    async fn try_delete(&self, key: &str, expected_revision: i64) -> StatebaseResult<WriteOutcome> {
        let mut tx = self.driver.begin_tx(TxOptions::default()).await?;
        let result = delete_in(&mut tx, key, expected_revision).await;
        finish(tx, result).await
    }

    /// Re-read the current row after losing an insert race.
    ///
    /// The losing transaction is unusable on some engines, so this runs in a
    /// fresh one.
    async fn conflict(&self, key: &str) -> StatebaseResult<WriteOutcome> {
        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = latest_row(&mut tx, key).await.map(|(revision, row)| {
            let live = row.filter(|r| !r.is_deleted());
            WriteOutcome::conflict(revision, live.as_ref().map(KeyValue::from))
        });
        finish(tx, result).await
    }
}

/// Commit on success, roll back on error.
async fn finish<T>(tx: Transaction<'_>, result: StatebaseResult<T>) -> StatebaseResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            tx.must_rollback().await;
            Err(err)
        }
    }
}

/// Store revision and the latest row for `key`, tombstones included.
async fn latest_row(tx: &mut Transaction<'_>, key: &str) -> StatebaseResult<(i64, Option<Row>)> {
    let set = tx
        .list(&ListQuery {
            filter: KeyFilter::Exact(key),
            revision: 0,
            include_deleted: true,
            limit: 1,
        })
        .await?;
    let revision = match set.current_revision {
        Some(revision) => revision,
        None => tx.current_revision().await?,
    };
    Ok((revision, set.rows.into_iter().next()))
}

/// Reject historical reads below the watermark or past the store revision.
fn check_read_revision(revision: i64, current: i64, watermark: i64) -> StatebaseResult<()> {
    if revision > 0 && revision < watermark {
        return Err(StatebaseError::Compacted {
            revision,
            compact_revision: watermark,
        });
    }
    if revision > current {
        return Err(StatebaseError::FutureRevision {
            revision,
            current_revision: current,
        });
    }
    Ok(())
}

fn check_writable(key: &str) -> StatebaseResult<()> {
    if key.is_empty() {
        return Err(StatebaseError::invalid("key must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StatebaseError::invalid(format!(
            "key exceeds {} bytes",
            MAX_KEY_LEN
        )));
    }
    if key == COMPACT_REV_KEY {
        return Err(StatebaseError::invalid(format!(
            "{} is reserved",
            COMPACT_REV_KEY
        )));
    }
    Ok(())
}

/// Exclusive upper bound of a prefix: the prefix with its last byte + 1.
pub fn prefix_end(prefix: &str) -> StatebaseResult<String> {
    let mut bytes = prefix.as_bytes().to_vec();
    match bytes.last_mut() {
        Some(last) if *last < 0x7f => *last += 1,
        Some(_) => {
            return Err(StatebaseError::invalid(
                "prefix must end with an ASCII character",
            ))
        }
        None => return Err(StatebaseError::invalid("prefix must not be empty")),
    }
    String::from_utf8(bytes).map_err(|e| StatebaseError::invalid(e.to_string()))
}

/// Lower bound of a list: the later of the prefix and the start key.
fn start_bound<'a>(prefix: &'a str, start_key: &'a str) -> (&'a str, bool) {
    if let Some(after) = start_key.strip_suffix('\0') {
        if after >= prefix {
            return (after, true);
        }
    }
    if start_key > prefix {
        (start_key, false)
    } else {
        (prefix, false)
    }
}

async fn create_in(
    tx: &mut Transaction<'_>,
    key: &str,
    value: &[u8],
    lease: i64,
) -> StatebaseResult<i64> {
    let (_, latest) = latest_row(tx, key).await?;

    // A new creation after a delete chains to the tombstone so the unique
    // index still holds.
    let (prev_revision, old_value): (i64, &[u8]) = match latest {
        Some(ref row) if !row.is_deleted() => return Err(StatebaseError::KeyExists),
        Some(ref row) => (row.id, &row.value),
        None => (0, &[]),
    };

    tx.insert(&NewRow {
        name: key,
        flags: RowFlags::CREATED,
        create_revision: 0,
        prev_revision,
        lease,
        value,
        old_value,
    })
    .await
}

async fn update_in(
    tx: &mut Transaction<'_>,
    key: &str,
    value: &[u8],
    expected_revision: i64,
    lease: i64,
) -> StatebaseResult<WriteOutcome> {
    let (revision, latest) = latest_row(tx, key).await?;
    let current = match latest {
        Some(row) if !row.is_deleted() => row,
        _ => return Ok(WriteOutcome::conflict(revision, None)),
    };
    if current.id != expected_revision {
        return Ok(WriteOutcome::conflict(revision, Some(KeyValue::from(&current))));
    }

    let create_revision = current.effective_create_revision();
    let id = tx
        .insert(&NewRow {
            name: key,
            flags: RowFlags::empty(),
            create_revision,
            prev_revision: current.id,
            lease,
            value,
            old_value: &current.value,
        })
        .await?;

    Ok(WriteOutcome {
        revision: id,
        kv: Some(KeyValue {
            key: key.to_string(),
            create_revision,
            mod_revision: id,
            value: value.to_vec(),
            lease,
        }),
        succeeded: true,
    })
}

async fn delete_in(
    tx: &mut Transaction<'_>,
    key: &str,
    expected_revision: i64,
) -> StatebaseResult<WriteOutcome> {
    let (revision, latest) = latest_row(tx, key).await?;
    let current = match latest {
        Some(row) if !row.is_deleted() => row,
        _ => {
            return Ok(WriteOutcome {
                revision,
                kv: None,
                succeeded: expected_revision == 0,
            })
        }
    };
    if expected_revision != 0 && current.id != expected_revision {
        return Ok(WriteOutcome::conflict(revision, Some(KeyValue::from(&current))));
    }

    let id = tx
        .insert(&NewRow {
            name: key,
            flags: RowFlags::DELETED,
            create_revision: current.effective_create_revision(),
            prev_revision: current.id,
            lease: current.lease,
            value: &current.value,
            old_value: &current.value,
        })
        .await?;

    Ok(WriteOutcome {
        revision: id,
        kv: Some(KeyValue::from(&current)),
        succeeded: true,
    })
}

async fn get_in(tx: &mut Transaction<'_>, key: &str, revision: i64) -> StatebaseResult<GetResult> {
    let set = tx
        .list(&ListQuery {
            filter: KeyFilter::Exact(key),
            revision,
            include_deleted: false,
            limit: 1,
        })
        .await?;
    let (current, watermark) = match (set.current_revision, set.compact_revision) {
        (Some(current), Some(watermark)) => (current, watermark),
        _ => (tx.current_revision().await?, tx.get_compact_revision().await?),
    };
    check_read_revision(revision, current, watermark)?;
    Ok(GetResult {
        revision: current,
        kv: set.rows.first().map(KeyValue::from),
    })
}

async fn list_in(
    tx: &mut Transaction<'_>,
    range: KeyRange<'_>,
    limit: i64,
    revision: i64,
) -> StatebaseResult<ListResult> {
    let fetch = if limit > 0 { limit + 1 } else { 0 };
    let set = tx
        .list(&ListQuery {
            filter: KeyFilter::Range(range),
            revision,
            include_deleted: false,
            limit: fetch,
        })
        .await?;

    let (current, watermark) = match (set.current_revision, set.compact_revision) {
        (Some(current), Some(watermark)) => (current, watermark),
        _ => (tx.current_revision().await?, tx.get_compact_revision().await?),
    };
    check_read_revision(revision, current, watermark)?;

    let mut kvs: Vec<KeyValue> = set.rows.iter().map(KeyValue::from).collect();
    let more = limit > 0 && kvs.len() as i64 > limit;
    if more {
        kvs.truncate(limit as usize);
    }
    Ok(ListResult {
        revision: current,
        kvs,
        more,
    })
}

async fn count_in(
    tx: &mut Transaction<'_>,
    range: KeyRange<'_>,
    revision: i64,
) -> StatebaseResult<(i64, i64)> {
    let (current, count) = tx.count(range, revision).await?;
    if revision != 0 {
        let watermark = tx.get_compact_revision().await?;
        check_read_revision(revision, current, watermark)?;
    }
    Ok((current, count))
}

async fn compact_in(tx: &mut Transaction<'_>, revision: i64) -> StatebaseResult<CompactResult> {
    let current = tx.current_revision().await?;
    let watermark = tx.get_compact_revision().await?;
    if revision > current {
        return Err(StatebaseError::FutureRevision {
            revision,
            current_revision: current,
        });
    }
    if revision <= watermark {
        return Ok(CompactResult {
            compact_revision: watermark,
            deleted_rows: 0,
        });
    }

    let deleted_rows = tx.compact(revision).await?;
    tx.set_compact_revision(revision).await?;
    Ok(CompactResult {
        compact_revision: revision,
        deleted_rows,
    })
}

#[async_trait]
impl Backend for SqlLog {
    async fn create(&self, key: &str, value: &[u8], lease: i64) -> StatebaseResult<i64> {
        check_writable(key)?;
        let mut tx = self.driver.begin_tx(TxOptions::default()).await?;
        let result = create_in(&mut tx, key, value, lease).await;
        let revision = finish(tx, result).await?;
        tracing::debug!(key, revision, "created key");
        Ok(revision)
    }

    async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
        lease: i64,
    ) -> StatebaseResult<WriteOutcome> {
        check_writable(key)?;
        let mut tx = self.driver.begin_tx(TxOptions::default()).await?;
        let result = update_in(&mut tx, key, value, expected_revision, lease).await;
        match finish(tx, result).await {
            Err(StatebaseError::KeyExists) => {
                tracing::debug!(key, expected_revision, "update lost insert race");
                self.conflict(key).await
            }
            Ok(outcome) => {
                tracing::debug!(
                    key,
                    expected_revision,
                    revision = outcome.revision,
                    succeeded = outcome.succeeded,
                    "update"
                );
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    async fn delete(&self, key: &str, expected_revision: i64) -> StatebaseResult<WriteOutcome> {
        check_writable(key)?;
        let mut result = self.try_delete(key, expected_revision).await;
        if expected_revision == 0 && matches!(result, Err(StatebaseError::KeyExists)) {
            tracing::debug!(key, "unconditional delete lost insert race; retrying");
            result = self.try_delete(key, 0).await;
        }
        match result {
            // An unconditional delete has no compare to fail. The competing
            // writer's row stands and nothing was removed by this call.
            Err(StatebaseError::KeyExists) if expected_revision == 0 => {
                tracing::warn!(key, "unconditional delete lost insert race twice");
                let outcome = self.conflict(key).await?;
                Ok(WriteOutcome {
                    kv: None,
                    succeeded: true,
                    ..outcome
                })
            }
            Err(StatebaseError::KeyExists) => {
                tracing::debug!(key, expected_revision, "delete lost insert race");
                self.conflict(key).await
            }
            Ok(outcome) => {
                tracing::debug!(
                    key,
                    expected_revision,
                    revision = outcome.revision,
                    succeeded = outcome.succeeded,
                    "delete"
                );
                Ok(outcome)
            }
            Err(err) => Err(err),
        }
    }

    async fn get(&self, key: &str, revision: i64) -> StatebaseResult<GetResult> {
        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = get_in(&mut tx, key, revision).await;
        finish(tx, result).await
    }

    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> StatebaseResult<ListResult> {
        let end = prefix_end(prefix)?;
        let (start, start_exclusive) = start_bound(prefix, start_key);
        let range = KeyRange {
            start,
            start_exclusive,
            end: &end,
        };

        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = list_in(&mut tx, range, limit, revision).await;
        finish(tx, result).await
    }

    async fn count(&self, prefix: &str, revision: i64) -> StatebaseResult<(i64, i64)> {
        let end = prefix_end(prefix)?;
        let range = KeyRange {
            start: prefix,
            start_exclusive: false,
            end: &end,
        };

        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = count_in(&mut tx, range, revision).await;
        finish(tx, result).await
    }

    async fn compact(&self, revision: i64) -> StatebaseResult<CompactResult> {
        let mut tx = self.driver.begin_tx(TxOptions::default()).await?;
        let result = compact_in(&mut tx, revision).await;
        let compacted = finish(tx, result).await?;
        if compacted.deleted_rows > 0 || compacted.compact_revision == revision {
            tracing::info!(
                revision,
                compact_revision = compacted.compact_revision,
                deleted_rows = compacted.deleted_rows,
                "compacted history"
            );
        }
        Ok(compacted)
    }

    async fn current_revision(&self) -> StatebaseResult<i64> {
        let mut tx = self.driver.begin_tx(TxOptions::read_only()).await?;
        let result = tx.current_revision().await;
        finish(tx, result).await
    }

    async fn db_size(&self) -> StatebaseResult<i64> {
        self.driver.size().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end("/registry/pods/").unwrap(), "/registry/pods0");
        assert_eq!(prefix_end("a").unwrap(), "b");
        assert!(prefix_end("").is_err());
    }

    #[test]
    fn test_start_bound_defaults_to_prefix() {
        assert_eq!(start_bound("a/", ""), ("a/", false));
        assert_eq!(start_bound("a/", "a"), ("a/", false));
    }

    #[test]
    fn test_start_bound_inclusive_start_key() {
        assert_eq!(start_bound("a/", "a/2"), ("a/2", false));
    }

    #[test]
    fn test_start_bound_nul_is_exclusive() {
        assert_eq!(start_bound("a/", "a/2\0"), ("a/2", true));
    }

    #[test]
    fn test_read_revision_bounds() {
        assert!(check_read_revision(0, 10, 5).is_ok());
        assert!(check_read_revision(5, 10, 5).is_ok());
        assert!(check_read_revision(10, 10, 5).is_ok());
        assert!(matches!(
            check_read_revision(4, 10, 5),
            Err(StatebaseError::Compacted {
                revision: 4,
                compact_revision: 5
            })
        ));
        assert!(matches!(
            check_read_revision(11, 10, 5),
            Err(StatebaseError::FutureRevision {
                revision: 11,
                current_revision: 10
            })
        ));
    }

    #[test]
    fn test_reserved_key_not_writable() {
        assert!(check_writable(COMPACT_REV_KEY).is_err());
        assert!(check_writable("").is_err());
        assert!(check_writable(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(check_writable("/registry/pods/a").is_ok());
    }
}
