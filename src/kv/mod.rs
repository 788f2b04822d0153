//! Revisioned key-value engine.
//!
//! [`Backend`] is the contract the etcd bridge is written against;
//! [`SqlLog`] implements it as an append-only log of rows over the SQL
//! storage layer.
//!
//! # Revisions
//!
//! - Revisions are the row ids of the log: strictly increasing, never
//!   reused, possibly with gaps.
//! - A key's `mod_revision` is the id of its latest row; `create_revision`
//!   is the id of the row that (re)created it.
//! - Conditional writes name the revision they expect; losing a race is a
//!   normal, non-error outcome.

pub mod backend;
pub mod compaction;
pub mod sqllog;

pub use backend::{Backend, CompactResult, GetResult, KeyValue, ListResult, WriteOutcome};
pub use compaction::CompactionPolicy;
pub use sqllog::{prefix_end, SqlLog, MAX_KEY_LEN};
