//! Statebase - etcd v3 API bridge persisting to a SQL datastore.
//!
//! Statebase speaks enough of the etcd v3 gRPC protocol for
//! Kubernetes-style clients (create, compare-and-swap update, delete, get,
//! prefix list, count, compaction) and stores every revision as a row in
//! MySQL, PostgreSQL or SQLite. There is no consensus layer: the database's
//! transactions and a unique index provide all concurrency control.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     etcd v3 gRPC clients                        │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    adapters::etcd (tonic)                       │
//! │     KV.Range/Txn │ Lease.Grant │ MemberList │ Status            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 kv::Backend  (kv::SqlLog)                       │
//! │       Create │ Update │ Delete │ Get │ List │ Count │ Compact   │
//! └─────────────────────────────────────────────────────────────────┘
//!                                  │
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                 storage (sqlx AnyPool)                          │
//! │          MySQL │ PostgreSQL │ SQLite dialects                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Module Organization
//!
//! ## Core
//! - [`core::config`] - Configuration parsing and validation
//! - [`core::runtime`] - Process lifecycle
//! - [`core::error`] - Error types
//!
//! ## Storage
//! - [`storage::dialect`] - Per-database SQL differences
//! - [`storage::generic`] - Pool, statement templates, schema setup
//! - [`storage::tx`] - Transaction wrapper
//!
//! ## KV
//! - [`kv::backend`] - Backend contract
//! - [`kv::sqllog`] - Log-structured engine
//! - [`kv::compaction`] - Retention policy for the compaction caller
//!
//! ## Adapters
//! - [`adapters::etcd`] - etcd v3 gRPC adapter
//!
//! ## CLI
//! - [`cli::commands`] - CLI command implementations
//!
//! # Key Invariants
//!
//! - Revisions are row ids: strictly increasing, never reused.
//! - At most one row per key names a given predecessor revision.
//! - A lost compare-and-swap is a result, never an error.

// Core infrastructure
pub mod core;

// SQL storage layer
pub mod storage;

// Revisioned key-value engine
pub mod kv;

// Protocol adapters
pub mod adapters;

// CLI
pub mod cli;

// Re-exports for convenience
pub use self::core::{config, error, runtime};
pub use adapters::etcd;
pub use kv::{Backend, SqlLog};
