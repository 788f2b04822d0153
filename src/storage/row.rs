//! Persisted row representation.
//!
//! One row exists per revision of a key. Rows are appended and never updated
//! in place; compaction is the only thing that removes them.

use bitflags::bitflags;
use sqlx::any::AnyRow;
use sqlx::Row as _;

bitflags! {
    /// Lifecycle markers stored in the `created` and `deleted` columns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RowFlags: u8 {
        /// Row creates the key.
        const CREATED = 0b0000_0001;
        /// Row is a tombstone.
        const DELETED = 0b0000_0010;
    }
}

/// A row read back from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Revision of this row; also the primary key.
    pub id: i64,
    /// Key name.
    pub name: String,
    /// Created/deleted markers.
    pub flags: RowFlags,
    /// Stored create revision; zero on creation rows.
    pub create_revision: i64,
    /// Previous row for the same key, zero if none.
    pub prev_revision: i64,
    /// Advisory lease id.
    pub lease: i64,
    /// Value at this revision.
    pub value: Vec<u8>,
    /// Value at the previous revision.
    pub old_value: Vec<u8>,
}

impl Row {
    /// Whether this row creates the key.
    pub fn is_created(&self) -> bool {
        self.flags.contains(RowFlags::CREATED)
    }

    /// Whether this row is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RowFlags::DELETED)
    }

    /// Revision at which the key was created.
    ///
    /// Creation rows cannot know their own id before insert, so they store
    /// zero and report their id instead.
    pub fn effective_create_revision(&self) -> i64 {
        if self.is_created() {
            self.id
        } else {
            self.create_revision
        }
    }

    /// Decode the nine row columns starting at `offset`.
    pub(crate) fn decode(row: &AnyRow, offset: usize) -> Result<Self, sqlx::Error> {
        let mut flags = RowFlags::empty();
        flags.set(
            RowFlags::CREATED,
            row.try_get::<i64, _>(offset + 2)? != 0,
        );
        flags.set(
            RowFlags::DELETED,
            row.try_get::<i64, _>(offset + 3)? != 0,
        );

        Ok(Self {
            id: row.try_get(offset)?,
            name: row.try_get(offset + 1)?,
            flags,
            create_revision: row.try_get(offset + 4)?,
            prev_revision: row.try_get(offset + 5)?,
            lease: row.try_get(offset + 6)?,
            value: row
                .try_get::<Option<Vec<u8>>, _>(offset + 7)?
                .unwrap_or_default(),
            old_value: row
                .try_get::<Option<Vec<u8>>, _>(offset + 8)?
                .unwrap_or_default(),
        })
    }
}

/// Columns for a row about to be appended.
#[derive(Debug, Clone, Copy)]
pub struct NewRow<'a> {
    pub name: &'a str,
    pub flags: RowFlags,
    pub create_revision: i64,
    pub prev_revision: i64,
    pub lease: i64,
    pub value: &'a [u8],
    pub old_value: &'a [u8],
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: i64, flags: RowFlags, create_revision: i64) -> Row {
        Row {
            id,
            name: "/registry/pods/a".to_string(),
            flags,
            create_revision,
            prev_revision: 0,
            lease: 0,
            value: vec![],
            old_value: vec![],
        }
    }

    #[test]
    fn test_creation_row_reports_own_id() {
        let created = row(7, RowFlags::CREATED, 0);
        assert!(created.is_created());
        assert_eq!(created.effective_create_revision(), 7);
    }

    #[test]
    fn test_update_row_reports_stored_create_revision() {
        let updated = row(9, RowFlags::empty(), 7);
        assert!(!updated.is_created());
        assert_eq!(updated.effective_create_revision(), 7);
    }

    #[test]
    fn test_tombstone_flags() {
        let tombstone = row(10, RowFlags::DELETED, 7);
        assert!(tombstone.is_deleted());
        assert!(!tombstone.is_created());
    }
}
