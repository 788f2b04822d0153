//! etcd transaction shape classification.
//!
//! etcd client libraries express create-if-absent, compare-and-swap update,
//! delete and compaction as generic `Txn` requests with a fixed shape. The
//! bridge recovers the intent from that shape once per request and only
//! implements those four operations:
//!
//! | Operation | Compare            | Success            | Failure |
//! |-----------|--------------------|--------------------|---------|
//! | Create    | `MOD(k) == 0`      | `[Put k]`          | `[]`    |
//! | Delete    | none               | `[Range, Delete k]`| `[]`    |
//! | Delete    | `MOD(k) == r`      | `[Delete k]`       | `[Range]` |
//! | Update    | `MOD(k) == r`      | `[Put k]`          | `[Range]` |
//! | Compact   | `VERSION(compact_rev_key) == n` | `[Put]` | `[Range]` |
//!
//! Shapes are tried in that order. Anything else is unsupported.

use super::proto::{
    compare::TargetUnion, request_op::Request, Compare, CompareResult, CompareTarget, PutRequest,
    TxnRequest,
};
use crate::storage::COMPACT_REV_KEY;

/// Operation recovered from a `Txn` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxnOperation {
    /// Create a key that must not exist.
    Create {
        key: String,
        value: Vec<u8>,
        lease: i64,
    },
    /// Replace a key at an expected revision.
    Update {
        key: String,
        expected_revision: i64,
        value: Vec<u8>,
        lease: i64,
    },
    /// Delete a key, conditionally unless `expected_revision` is zero.
    Delete { key: String, expected_revision: i64 },
    /// Compact history up to `target_revision`; zero is a no-op.
    Compact { target_revision: i64 },
    /// Any other shape.
    Unsupported { reason: String },
}

impl TxnOperation {
    fn unsupported(reason: impl Into<String>) -> Self {
        Self::Unsupported {
            reason: reason.into(),
        }
    }

    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
            Self::Compact { .. } => "compact",
            Self::Unsupported { .. } => "unsupported",
        }
    }
}

/// Classify a `Txn` request.
pub fn classify(txn: &TxnRequest) -> TxnOperation {
    if let Some(put) = as_create(txn) {
        return put_operation(put, |key, value, lease| TxnOperation::Create { key, value, lease });
    }
    if let Some((key, expected_revision)) = as_delete(txn) {
        return match utf8_key(key) {
            Ok(key) => TxnOperation::Delete {
                key,
                expected_revision,
            },
            Err(op) => op,
        };
    }
    if let Some((expected_revision, put)) = as_update(txn) {
        if expected_revision == 0 {
            return put_operation(put, |key, value, lease| TxnOperation::Create { key, value, lease });
        }
        return put_operation(put, |key, value, lease| TxnOperation::Update {
            key,
            expected_revision,
            value,
            lease,
        });
    }
    if let Some(put) = as_compact(txn) {
        if let Err(op) = check_put_flags(put) {
            return op;
        }
        // The compactor writes the target as a decimal string.
        let target_revision = std::str::from_utf8(&put.value)
            .ok()
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(0);
        return TxnOperation::Compact { target_revision };
    }
    TxnOperation::unsupported("transaction shape")
}

fn is_mod_equal(cmp: &Compare) -> bool {
    cmp.target() == CompareTarget::Mod && cmp.result() == CompareResult::Equal && cmp.range_end.is_empty()
}

fn mod_revision(cmp: &Compare) -> i64 {
    match cmp.target_union {
        Some(TargetUnion::ModRevision(revision)) => revision,
        _ => 0,
    }
}

fn as_put(op: &super::proto::RequestOp) -> Option<&PutRequest> {
    match op.request {
        Some(Request::RequestPut(ref put)) => Some(put),
        _ => None,
    }
}

fn is_range(op: &super::proto::RequestOp) -> bool {
    matches!(op.request, Some(Request::RequestRange(_)))
}

fn as_create(txn: &TxnRequest) -> Option<&PutRequest> {
    match (txn.compare.as_slice(), txn.success.as_slice()) {
        ([cmp], [op]) if txn.failure.is_empty() && is_mod_equal(cmp) && mod_revision(cmp) == 0 => {
            as_put(op).filter(|put| put.key == cmp.key)
        }
        _ => None,
    }
}

fn as_delete(txn: &TxnRequest) -> Option<(&[u8], i64)> {
    match (txn.compare.as_slice(), txn.success.as_slice(), txn.failure.as_slice()) {
        ([], [read, op], []) if is_range(read) => match op.request {
            Some(Request::RequestDeleteRange(ref del)) if del.range_end.is_empty() => {
                Some((del.key.as_slice(), 0))
            }
            _ => None,
        },
        ([cmp], [op], [read]) if is_mod_equal(cmp) && is_range(read) => match op.request {
            Some(Request::RequestDeleteRange(ref del))
                if del.range_end.is_empty() && del.key == cmp.key =>
            {
                Some((cmp.key.as_slice(), mod_revision(cmp)))
            }
            _ => None,
        },
        _ => None,
    }
}

fn as_update(txn: &TxnRequest) -> Option<(i64, &PutRequest)> {
    match (txn.compare.as_slice(), txn.success.as_slice(), txn.failure.as_slice()) {
        ([cmp], [op], [read]) if is_mod_equal(cmp) && is_range(read) => as_put(op)
            .filter(|put| put.key == cmp.key)
            .map(|put| (mod_revision(cmp), put)),
        _ => None,
    }
}

fn as_compact(txn: &TxnRequest) -> Option<&PutRequest> {
    match (txn.compare.as_slice(), txn.success.as_slice(), txn.failure.as_slice()) {
        ([cmp], [op], [read])
            if cmp.target() == CompareTarget::Version
                && cmp.result() == CompareResult::Equal
                && cmp.key == COMPACT_REV_KEY.as_bytes()
                && is_range(read) =>
        {
            as_put(op)
        }
        _ => None,
    }
}

fn check_put_flags(put: &PutRequest) -> Result<(), TxnOperation> {
    if put.prev_kv {
        return Err(TxnOperation::unsupported("put prev_kv"));
    }
    if put.ignore_value {
        return Err(TxnOperation::unsupported("put ignore_value"));
    }
    if put.ignore_lease {
        return Err(TxnOperation::unsupported("put ignore_lease"));
    }
    Ok(())
}

fn utf8_key(key: &[u8]) -> Result<String, TxnOperation> {
    String::from_utf8(key.to_vec()).map_err(|_| TxnOperation::unsupported("non UTF-8 key"))
}

fn put_operation(
    put: &PutRequest,
    build: impl FnOnce(String, Vec<u8>, i64) -> TxnOperation,
) -> TxnOperation {
    if let Err(op) = check_put_flags(put) {
        return op;
    }
    match utf8_key(&put.key) {
        Ok(key) => build(key, put.value.clone(), put.lease),
        Err(op) => op,
    }
}
