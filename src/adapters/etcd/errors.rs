//! etcd adapter error mapping.
//!
//! Statebase errors map to gRPC status codes with the message strings etcd
//! clients match on:
//! - Compacted / FutureRevision → OUT_OF_RANGE
//! - Unsupported → UNIMPLEMENTED
//! - InvalidRequest → INVALID_ARGUMENT
//! - KeyExists → FAILED_PRECONDITION

use crate::core::error::StatebaseError;

/// etcd's message for a read below the compaction watermark.
pub const ERR_COMPACTED: &str = "etcdserver: mvcc: required revision has been compacted";

/// etcd's message for a read above the current revision.
pub const ERR_FUTURE_REV: &str = "etcdserver: mvcc: required revision is a future revision";

/// Convert a StatebaseError to an etcd-compatible error response.
pub fn to_etcd_error(err: &StatebaseError) -> EtcdError {
    match err {
        StatebaseError::Compacted { .. } => EtcdError {
            code: GrpcCode::OutOfRange,
            message: ERR_COMPACTED.to_string(),
        },

        StatebaseError::FutureRevision { .. } => EtcdError {
            code: GrpcCode::OutOfRange,
            message: ERR_FUTURE_REV.to_string(),
        },

        StatebaseError::Unsupported { .. } => EtcdError {
            code: GrpcCode::Unimplemented,
            message: err.to_string(),
        },

        StatebaseError::InvalidRequest { message } => EtcdError {
            code: GrpcCode::InvalidArgument,
            message: message.clone(),
        },

        StatebaseError::KeyExists => EtcdError {
            code: GrpcCode::FailedPrecondition,
            message: "etcdserver: key already exists".to_string(),
        },

        StatebaseError::Database(_) | StatebaseError::Internal { .. } => EtcdError {
            code: GrpcCode::Internal,
            message: err.to_string(),
        },
    }
}

/// gRPC status codes used by etcd.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrpcCode {
    Ok,
    InvalidArgument,
    FailedPrecondition,
    OutOfRange,
    Unimplemented,
    Internal,
}

/// etcd error response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdError {
    /// gRPC status code.
    pub code: GrpcCode,
    /// Error message.
    pub message: String,
}

#[cfg(feature = "grpc")]
impl From<EtcdError> for tonic::Status {
    fn from(err: EtcdError) -> Self {
        let code = match err.code {
            GrpcCode::Ok => tonic::Code::Ok,
            GrpcCode::InvalidArgument => tonic::Code::InvalidArgument,
            GrpcCode::FailedPrecondition => tonic::Code::FailedPrecondition,
            GrpcCode::OutOfRange => tonic::Code::OutOfRange,
            GrpcCode::Unimplemented => tonic::Code::Unimplemented,
            GrpcCode::Internal => tonic::Code::Internal,
        };
        tonic::Status::new(code, err.message)
    }
}

/// Convert a StatebaseError to a tonic Status.
#[cfg(feature = "grpc")]
pub fn to_status(err: &StatebaseError) -> tonic::Status {
    to_etcd_error(err).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compacted_maps_to_out_of_range() {
        let err = to_etcd_error(&StatebaseError::Compacted {
            revision: 3,
            compact_revision: 10,
        });
        assert_eq!(err.code, GrpcCode::OutOfRange);
        assert_eq!(err.message, ERR_COMPACTED);
    }

    #[test]
    fn test_unsupported_maps_to_unimplemented() {
        let err = to_etcd_error(&StatebaseError::unsupported("put"));
        assert_eq!(err.code, GrpcCode::Unimplemented);
        assert_eq!(err.message, "put is not supported");
    }

    #[test]
    fn test_invalid_keeps_message() {
        let err = to_etcd_error(&StatebaseError::invalid("bad range"));
        assert_eq!(err.code, GrpcCode::InvalidArgument);
        assert_eq!(err.message, "bad range");
    }
}
