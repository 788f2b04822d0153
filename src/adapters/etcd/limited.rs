//! Limited etcd-semantics server.
//!
//! Translates `Range` and `Txn` requests into [`Backend`] calls and builds
//! etcd-shaped responses. Only the transaction shapes recognised by
//! [`classify`] are served; everything else is rejected as unsupported
//! rather than approximated.

use super::proto;
use super::proto::{response_op::Response, ResponseOp};
use super::txn::{classify, TxnOperation};
use crate::core::config::ListenerConfig;
use crate::core::error::{StatebaseError, StatebaseResult};
use crate::kv::{Backend, KeyValue};
use std::sync::Arc;

/// Raft term reported in every header; there is no raft.
pub const RAFT_TERM: u64 = 1;

/// Identity fields copied into every response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTemplate {
    pub cluster_id: u64,
    pub member_id: u64,
}

impl Default for HeaderTemplate {
    fn default() -> Self {
        Self {
            cluster_id: 1,
            member_id: 1,
        }
    }
}

impl From<&ListenerConfig> for HeaderTemplate {
    fn from(config: &ListenerConfig) -> Self {
        Self {
            cluster_id: config.cluster_id,
            member_id: config.member_id,
        }
    }
}

impl HeaderTemplate {
    /// Header for a response at `revision`.
    pub fn at(&self, revision: i64) -> proto::ResponseHeader {
        proto::ResponseHeader {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision,
            raft_term: RAFT_TERM,
        }
    }
}

fn to_proto_kv(kv: KeyValue) -> proto::KeyValue {
    proto::KeyValue {
        key: kv.key.into_bytes(),
        create_revision: kv.create_revision,
        mod_revision: kv.mod_revision,
        version: 0,
        value: kv.value,
        lease: kv.lease,
    }
}

fn utf8(bytes: &[u8], what: &str) -> StatebaseResult<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|_| StatebaseError::unsupported(format!("non UTF-8 {}", what)))
}

/// Prefix whose prefix end is `range_end`: the last byte decremented.
fn prefix_of_range_end(range_end: &[u8]) -> StatebaseResult<String> {
    let mut bytes = range_end.to_vec();
    match bytes.last_mut() {
        Some(last) if *last > 0 && *last <= 0x7f => *last -= 1,
        _ => return Err(StatebaseError::unsupported("range_end other than a prefix end")),
    }
    utf8(&bytes, "range_end")
}

fn check_range_options(req: &proto::RangeRequest) -> StatebaseResult<()> {
    if req.sort_order != proto::SortOrder::None as i32 {
        return Err(StatebaseError::unsupported("range sort_order"));
    }
    if req.sort_target != proto::SortTarget::Key as i32 {
        return Err(StatebaseError::unsupported("range sort_target"));
    }
    if req.serializable {
        return Err(StatebaseError::unsupported("serializable range"));
    }
    if req.keys_only {
        return Err(StatebaseError::unsupported("range keys_only"));
    }
    if req.min_mod_revision != 0
        || req.max_mod_revision != 0
        || req.min_create_revision != 0
        || req.max_create_revision != 0
    {
        return Err(StatebaseError::unsupported("range revision filters"));
    }
    if req.limit < 0 {
        return Err(StatebaseError::invalid("range limit must be >= 0"));
    }
    Ok(())
}

/// etcd `Range`/`Txn` front end over a [`Backend`].
#[derive(Clone)]
pub struct LimitedServer {
    backend: Arc<dyn Backend>,
    header: HeaderTemplate,
}

impl std::fmt::Debug for LimitedServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimitedServer")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

impl LimitedServer {
    /// Create a server over `backend`.
    pub fn new(backend: Arc<dyn Backend>, header: HeaderTemplate) -> Self {
        Self { backend, header }
    }

    /// The header template.
    pub fn header(&self) -> HeaderTemplate {
        self.header
    }

    /// Highest revision written.
    pub async fn current_revision(&self) -> StatebaseResult<i64> {
        self.backend.current_revision().await
    }

    /// Storage size in bytes.
    pub async fn db_size(&self) -> StatebaseResult<i64> {
        self.backend.db_size().await
    }

    /// Handle a Range request: a Get without `range_end`, a List or Count
    /// over a prefix with one.
    pub async fn range(&self, req: proto::RangeRequest) -> StatebaseResult<proto::RangeResponse> {
        check_range_options(&req)?;
        let key = utf8(&req.key, "key")?;

        if req.range_end.is_empty() {
            let result = self.backend.get(&key, req.revision).await?;
            let kvs: Vec<proto::KeyValue> = result.kv.into_iter().map(to_proto_kv).collect();
            let count = kvs.len() as i64;
            return Ok(proto::RangeResponse {
                header: Some(self.header.at(result.revision)),
                kvs: if req.count_only { vec![] } else { kvs },
                more: false,
                count,
            });
        }

        let prefix = prefix_of_range_end(&req.range_end)?;
        if !key.starts_with(&prefix) {
            return Err(StatebaseError::unsupported(
                "range_end other than a prefix end",
            ));
        }

        if req.count_only {
            let (revision, count) = self.backend.count(&prefix, req.revision).await?;
            return Ok(proto::RangeResponse {
                header: Some(self.header.at(revision)),
                kvs: vec![],
                more: false,
                count,
            });
        }

        let result = self
            .backend
            .list(&prefix, &key, req.limit, req.revision)
            .await?;
        let mut count = result.kvs.len() as i64;
        if result.more {
            count = self.backend.count(&prefix, req.revision).await?.1;
        }
        Ok(proto::RangeResponse {
            header: Some(self.header.at(result.revision)),
            kvs: result.kvs.into_iter().map(to_proto_kv).collect(),
            more: result.more,
            count,
        })
    }

    /// Handle a Txn request of one of the recognised shapes.
    pub async fn txn(&self, req: proto::TxnRequest) -> StatebaseResult<proto::TxnResponse> {
        let op = classify(&req);
        tracing::debug!(kind = op.kind(), "txn");

        match op {
            TxnOperation::Create { key, value, lease } => self.create(&key, &value, lease).await,
            TxnOperation::Update {
                key,
                expected_revision,
                value,
                lease,
            } => self.update(&key, expected_revision, &value, lease).await,
            TxnOperation::Delete {
                key,
                expected_revision,
            } => self.delete(&key, expected_revision).await,
            TxnOperation::Compact { target_revision } => self.compact(target_revision).await,
            TxnOperation::Unsupported { reason } => Err(StatebaseError::unsupported(reason)),
        }
    }

    fn put_response(&self, revision: i64) -> ResponseOp {
        ResponseOp {
            response: Some(Response::ResponsePut(proto::PutResponse {
                header: Some(self.header.at(revision)),
                prev_kv: None,
            })),
        }
    }

    fn range_response(&self, revision: i64, kv: Option<KeyValue>) -> ResponseOp {
        let kvs: Vec<proto::KeyValue> = kv.into_iter().map(to_proto_kv).collect();
        ResponseOp {
            response: Some(Response::ResponseRange(proto::RangeResponse {
                header: Some(self.header.at(revision)),
                count: kvs.len() as i64,
                kvs,
                more: false,
            })),
        }
    }

    fn delete_range_response(
        &self,
        revision: i64,
        deleted: i64,
        prev_kvs: Vec<proto::KeyValue>,
    ) -> ResponseOp {
        ResponseOp {
            response: Some(Response::ResponseDeleteRange(proto::DeleteRangeResponse {
                header: Some(self.header.at(revision)),
                deleted,
                prev_kvs,
            })),
        }
    }

    async fn create(&self, key: &str, value: &[u8], lease: i64) -> StatebaseResult<proto::TxnResponse> {
        match self.backend.create(key, value, lease).await {
            Ok(revision) => Ok(proto::TxnResponse {
                header: Some(self.header.at(revision)),
                succeeded: true,
                responses: vec![self.put_response(revision)],
            }),
            Err(StatebaseError::KeyExists) => {
                let revision = self.backend.current_revision().await?;
                Ok(proto::TxnResponse {
                    header: Some(self.header.at(revision)),
                    succeeded: false,
                    responses: vec![],
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn update(
        &self,
        key: &str,
        expected_revision: i64,
        value: &[u8],
        lease: i64,
    ) -> StatebaseResult<proto::TxnResponse> {
        let outcome = self
            .backend
            .update(key, value, expected_revision, lease)
            .await?;
        let response = if outcome.succeeded {
            self.put_response(outcome.revision)
        } else {
            self.range_response(outcome.revision, outcome.kv)
        };
        Ok(proto::TxnResponse {
            header: Some(self.header.at(outcome.revision)),
            succeeded: outcome.succeeded,
            responses: vec![response],
        })
    }

    async fn delete(&self, key: &str, expected_revision: i64) -> StatebaseResult<proto::TxnResponse> {
        let outcome = self.backend.delete(key, expected_revision).await?;
        let revision = outcome.revision;

        // Conditional: success runs [DeleteRange], failure runs [Range].
        // Unconditional: [Range, DeleteRange].
        let responses = if !outcome.succeeded {
            vec![self.range_response(revision, outcome.kv)]
        } else if expected_revision == 0 {
            let deleted = i64::from(outcome.kv.is_some());
            vec![
                self.range_response(revision, outcome.kv),
                self.delete_range_response(revision, deleted, vec![]),
            ]
        } else {
            let prev_kvs: Vec<proto::KeyValue> = outcome.kv.into_iter().map(to_proto_kv).collect();
            vec![self.delete_range_response(revision, prev_kvs.len() as i64, prev_kvs)]
        };

        Ok(proto::TxnResponse {
            header: Some(self.header.at(revision)),
            succeeded: outcome.succeeded,
            responses,
        })
    }

    async fn compact(&self, target_revision: i64) -> StatebaseResult<proto::TxnResponse> {
        if target_revision > 0 {
            self.backend.compact(target_revision).await?;
        }
        let revision = self.backend.current_revision().await?;
        Ok(proto::TxnResponse {
            header: Some(self.header.at(revision)),
            succeeded: true,
            responses: vec![self.put_response(revision)],
        })
    }
}
