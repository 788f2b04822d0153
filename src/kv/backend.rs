//! Backend contract consumed by the etcd bridge.
//!
//! The limited server only ever talks to a `dyn Backend`, so the storage
//! engine can be swapped without touching protocol code.

use crate::core::error::StatebaseResult;
use async_trait::async_trait;

/// A key at one revision, as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub value: Vec<u8>,
    pub lease: i64,
}

/// Result of a conditional write.
///
/// `succeeded == false` is a compare-and-swap conflict, not an error. `kv`
/// then carries the current row (if the key exists) so the caller can
/// report it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// Revision of the new row on success; store revision otherwise.
    pub revision: i64,
    /// The written row for updates, the deleted row for deletes, or the
    /// current row on conflict.
    pub kv: Option<KeyValue>,
    pub succeeded: bool,
}

impl WriteOutcome {
    /// Conflict outcome carrying the current row.
    pub fn conflict(revision: i64, kv: Option<KeyValue>) -> Self {
        Self {
            revision,
            kv,
            succeeded: false,
        }
    }
}

/// Result of a single-key read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetResult {
    /// Store revision at the time of the read.
    pub revision: i64,
    pub kv: Option<KeyValue>,
}

/// Result of a prefix read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListResult {
    /// Store revision at the time of the read.
    pub revision: i64,
    /// Live keys in ascending key order.
    pub kvs: Vec<KeyValue>,
    /// More keys exist beyond the limit.
    pub more: bool,
}

/// Result of a compaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactResult {
    /// Watermark after the call.
    pub compact_revision: i64,
    /// Rows physically removed.
    pub deleted_rows: u64,
}

/// Revisioned key-value store operations.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create a key that has no live row. Fails with `KeyExists` otherwise.
    async fn create(&self, key: &str, value: &[u8], lease: i64) -> StatebaseResult<i64>;

    /// Replace the value if the key's current revision is `expected_revision`.
    async fn update(
        &self,
        key: &str,
        value: &[u8],
        expected_revision: i64,
        lease: i64,
    ) -> StatebaseResult<WriteOutcome>;

    /// Write a tombstone if the key's current revision is `expected_revision`
    /// (or unconditionally when it is zero).
    async fn delete(&self, key: &str, expected_revision: i64) -> StatebaseResult<WriteOutcome>;

    /// Latest live row for `key` at or below `revision` (zero means latest).
    async fn get(&self, key: &str, revision: i64) -> StatebaseResult<GetResult>;

    /// Live keys under `prefix` at `revision`, starting at `start_key`.
    ///
    /// A `start_key` ending in NUL starts strictly after the key without it.
    async fn list(
        &self,
        prefix: &str,
        start_key: &str,
        limit: i64,
        revision: i64,
    ) -> StatebaseResult<ListResult>;

    /// Store revision and number of live keys under `prefix` at `revision`
    /// (zero means latest).
    async fn count(&self, prefix: &str, revision: i64) -> StatebaseResult<(i64, i64)>;

    /// Remove history at or below `revision` and advance the watermark.
    async fn compact(&self, revision: i64) -> StatebaseResult<CompactResult>;

    /// Highest revision written.
    async fn current_revision(&self) -> StatebaseResult<i64>;

    /// Storage size in bytes.
    async fn db_size(&self) -> StatebaseResult<i64>;
}
