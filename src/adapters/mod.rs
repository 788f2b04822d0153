//! Protocol adapters.
//!
//! - [`etcd`] - etcd v3 gRPC API over the revisioned key-value engine

pub mod etcd;
