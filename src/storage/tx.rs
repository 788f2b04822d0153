//! Revision-scoped unit of work over one SQL transaction.
//!
//! Every engine call opens exactly one [`Transaction`]. Dropping it without
//! committing (for example when a request deadline cancels the future) rolls
//! it back when the connection returns to the pool.

use super::dialect::COMPACT_REV_KEY;
use super::generic::{Generic, KeyFilter, KeyRange};
use super::row::{NewRow, Row, RowFlags};
use crate::core::error::{StatebaseError, StatebaseResult};
use sqlx::any::{Any, AnyRow};
use sqlx::Row as _;

/// Parameters of a list read.
#[derive(Debug, Clone, Copy)]
pub struct ListQuery<'a> {
    /// Keys to scan.
    pub filter: KeyFilter<'a>,
    /// Read as of this revision; zero means latest.
    pub revision: i64,
    /// Return tombstones as well as live rows.
    pub include_deleted: bool,
    /// Maximum rows; zero means unlimited.
    pub limit: i64,
}

/// Rows returned by a list read, with the store revisions seen by the same
/// statement.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    /// Store revision, when at least one row came back.
    pub current_revision: Option<i64>,
    /// Compaction watermark, when at least one row came back.
    pub compact_revision: Option<i64>,
    /// Latest row per key in key order.
    pub rows: Vec<Row>,
}

/// A SQL transaction plus the driver that owns its statements.
pub struct Transaction<'a> {
    inner: sqlx::Transaction<'static, Any>,
    driver: &'a Generic,
}

impl<'a> Transaction<'a> {
    pub(crate) fn new(inner: sqlx::Transaction<'static, Any>, driver: &'a Generic) -> Self {
        Self { inner, driver }
    }

    /// Commit the transaction.
    pub async fn commit(self) -> StatebaseResult<()> {
        self.inner.commit().await?;
        Ok(())
    }

    /// Roll back the transaction.
    pub async fn rollback(self) -> StatebaseResult<()> {
        self.inner.rollback().await?;
        Ok(())
    }

    /// Roll back, treating an already closed connection as done.
    ///
    /// # Panics
    ///
    /// Panics if the rollback fails for any other reason, which means the
    /// connection is in a state no caller can recover from.
    pub async fn must_rollback(self) {
        match self.inner.rollback().await {
            Ok(()) => {}
            Err(sqlx::Error::PoolClosed | sqlx::Error::Io(_) | sqlx::Error::WorkerCrashed) => {
                tracing::debug!("transaction already closed");
            }
            Err(err) => panic!("failed to roll back transaction: {}", err),
        }
    }

    /// Highest revision in the table, zero when empty.
    pub async fn current_revision(&mut self) -> StatebaseResult<i64> {
        let driver = self.driver;
        sqlx::query_scalar::<_, i64>(&driver.sql.current_revision)
            .fetch_one(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))
    }

    /// Compaction watermark, zero when never compacted.
    pub async fn get_compact_revision(&mut self) -> StatebaseResult<i64> {
        let driver = self.driver;
        sqlx::query_scalar::<_, i64>(&driver.sql.compact_revision)
            .fetch_one(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))
    }

    /// Move the compaction watermark, inserting the watermark row the first
    /// time.
    ///
    /// Two first compactions racing on an empty watermark can both insert a
    /// row. Only the newest one is kept and moved.
    pub async fn set_compact_revision(&mut self, revision: i64) -> StatebaseResult<()> {
        let driver = self.driver;
        let stale = sqlx::query(&driver.sql.delete_stale_compact)
            .execute(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;
        if stale.rows_affected() > 0 {
            tracing::warn!(
                rows = stale.rows_affected(),
                "removed duplicate compaction watermark rows"
            );
        }

        let result = sqlx::query(&driver.sql.update_compact)
            .bind(revision)
            .execute(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;

        if result.rows_affected() == 0 {
            self.insert(&NewRow {
                name: COMPACT_REV_KEY,
                flags: RowFlags::CREATED,
                create_revision: 0,
                prev_revision: revision,
                lease: 0,
                value: &[],
                old_value: &[],
            })
            .await?;
        }
        Ok(())
    }

    /// Delete superseded rows and tombstones at or below `revision`.
    ///
    /// Returns the number of rows removed.
    pub async fn compact(&mut self, revision: i64) -> StatebaseResult<u64> {
        let driver = self.driver;
        let result = sqlx::query(&driver.sql.compact)
            .bind(revision)
            .bind(revision)
            .execute(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;
        Ok(result.rows_affected())
    }

    /// Delete the row with the given revision.
    pub async fn delete_revision(&mut self, revision: i64) -> StatebaseResult<()> {
        let driver = self.driver;
        sqlx::query(&driver.sql.delete_revision)
            .bind(revision)
            .execute(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;
        Ok(())
    }

    /// Fetch the row with the given revision.
    pub async fn get_revision(&mut self, revision: i64) -> StatebaseResult<Option<Row>> {
        let driver = self.driver;
        let row = sqlx::query(&driver.sql.get_revision)
            .bind(revision)
            .fetch_optional(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;
        row.map(|r| Row::decode(&r, 2))
            .transpose()
            .map_err(StatebaseError::from)
    }

    /// Latest row per key matching the query.
    pub async fn list(&mut self, query: &ListQuery<'_>) -> StatebaseResult<RowSet> {
        let driver = self.driver;
        let template = match query.filter {
            KeyFilter::Exact(_) => &driver.sql.list_exact,
            KeyFilter::Range(range) if range.start_exclusive => &driver.sql.list_range_after,
            KeyFilter::Range(_) => &driver.sql.list_range,
        };
        let sql = if query.limit > 0 {
            format!("{} LIMIT {}", template, query.limit)
        } else {
            template.clone()
        };

        let mut statement = sqlx::query(&sql);
        statement = match query.filter {
            KeyFilter::Exact(name) => statement.bind(name),
            KeyFilter::Range(range) => statement.bind(range.start).bind(range.end),
        };
        let rows: Vec<AnyRow> = statement
            .bind(read_revision(query.revision))
            .bind(query.include_deleted)
            .fetch_all(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;

        let mut set = RowSet::default();
        for row in &rows {
            if set.current_revision.is_none() {
                set.current_revision = Some(row.try_get(0)?);
                set.compact_revision = Some(row.try_get(1)?);
            }
            set.rows.push(Row::decode(row, 2)?);
        }
        Ok(set)
    }

    /// Store revision and number of live keys in a range as of `revision`.
    pub async fn count(&mut self, range: KeyRange<'_>, revision: i64) -> StatebaseResult<(i64, i64)> {
        let driver = self.driver;
        let template = if range.start_exclusive {
            &driver.sql.count_range_after
        } else {
            &driver.sql.count_range
        };
        let row = sqlx::query(template)
            .bind(range.start)
            .bind(range.end)
            .bind(read_revision(revision))
            .bind(false)
            .fetch_one(&mut *self.inner)
            .await
            .map_err(|e| driver.translate_err(e))?;
        Ok((row.try_get(0)?, row.try_get(1)?))
    }

    /// Append a row and return its revision.
    ///
    /// A collision on `(name, prev_revision)` comes back as
    /// [`StatebaseError::KeyExists`].
    pub async fn insert(&mut self, row: &NewRow<'_>) -> StatebaseResult<i64> {
        let driver = self.driver;
        let statement = sqlx::query(&driver.sql.insert)
            .bind(row.name)
            .bind(i32::from(row.flags.contains(RowFlags::CREATED)))
            .bind(i32::from(row.flags.contains(RowFlags::DELETED)))
            .bind(row.create_revision)
            .bind(row.prev_revision)
            .bind(row.lease)
            .bind(row.value)
            .bind(row.old_value);

        if driver.sql.insert_returns_id {
            let returned = statement
                .fetch_one(&mut *self.inner)
                .await
                .map_err(|e| driver.translate_err(e))?;
            Ok(returned.try_get(0)?)
        } else {
            let result = statement
                .execute(&mut *self.inner)
                .await
                .map_err(|e| driver.translate_err(e))?;
            result
                .last_insert_id()
                .ok_or_else(|| StatebaseError::internal("driver returned no insert id"))
        }
    }
}

fn read_revision(revision: i64) -> i64 {
    if revision > 0 {
        revision
    } else {
        i64::MAX
    }
}
