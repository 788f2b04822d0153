//! etcd v3 gRPC adapter.
//!
//! Exposes the subset of the etcd v3 API that Kubernetes-style clients use
//! against a [`Backend`](crate::kv::Backend).
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┬─────────────┬─────────────┬───────────────────┐
//! │   KV API    │  Lease API  │ Cluster API │  Maintenance API  │
//! │ Range / Txn │ Grant (stub)│ MemberList  │      Status       │
//! └─────────────┴─────────────┴─────────────┴───────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Limited Server                          │
//! │  - Txn shape → Create / Update / Delete / Compact           │
//! │  - Range → Get / List / Count                               │
//! │  - etcd-shaped responses and headers                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                       dyn Backend (SqlLog)
//! ```
//!
//! # Modules
//!
//! - [`proto`] - etcd wire messages
//! - [`txn`] - Txn shape classification
//! - [`limited`] - Range/Txn translation onto the backend
//! - [`grpc`] - tonic services, framing and listener
//! - [`errors`] - Error mapping to gRPC status codes

pub mod errors;
#[cfg(feature = "grpc")]
pub mod grpc;
pub mod limited;
pub mod proto;
pub mod txn;

// Re-export commonly used types
pub use errors::{to_etcd_error, EtcdError, GrpcCode};
#[cfg(feature = "grpc")]
pub use grpc::{client_urls, EtcdGrpcServer, SharedState};
pub use limited::{HeaderTemplate, LimitedServer};
pub use txn::{classify, TxnOperation};
