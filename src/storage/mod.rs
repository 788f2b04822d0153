//! SQL storage layer.
//!
//! Everything that speaks SQL lives here: dialect differences, the pooled
//! driver with its statement templates, and the transaction wrapper the
//! engine drives.
//!
//! # Modules
//!
//! - [`dialect`] - Dialect trait and selection
//! - [`mysql`], [`postgres`], [`sqlite`] - Per-engine schema and SQL
//! - [`generic`] - Pool, templates, startup and error translation
//! - [`tx`] - Transaction wrapper
//! - [`row`] - Persisted row types
//!
//! # Invariants
//!
//! - The unique index on `(name, prev_revision)` is the only concurrency
//!   control: two writers claiming the same predecessor cannot both insert.
//! - Rows are appended, never updated; only compaction deletes them. The
//!   compaction watermark row is the single exception.

pub mod dialect;
pub mod generic;
pub mod mysql;
pub mod postgres;
pub mod row;
pub mod sqlite;
pub mod tx;

// Re-exports for convenience
pub use dialect::{Dialect, DialectKind, COMPACT_REV_KEY, TABLE_NAME};
pub use generic::{Generic, KeyFilter, KeyRange, TxOptions};
pub use row::{NewRow, Row, RowFlags};
pub use tx::{ListQuery, RowSet, Transaction};
