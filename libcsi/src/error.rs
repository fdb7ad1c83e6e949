//! CSI error types.
//!
//! All errors in the `libcsi` crate are represented by the [`CsiError`] enum.
//! Besides describing what went wrong, an error answers the one question the
//! attacher's state machine cares about: is the failed operation *final*
//! (it did not happen and is not still running on the driver), or may it
//! still be in progress?

use thiserror::Error;
use tonic::{Code, Status};

/// Unified error type for CSI operations.
#[derive(Debug, Error, Clone)]
pub enum CsiError {
    /// The driver answered with a non-OK gRPC status.
    #[error("rpc error: code = {:?} desc = {}", .0.code(), .0.message())]
    Rpc(Status),

    /// The channel to the driver could not be established or broke.
    #[error("transport error: {0}")]
    TransportError(String),

    /// The driver address could not be parsed.
    #[error("invalid CSI address {0:?}")]
    InvalidAddress(String),

    /// The caller supplied an invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CsiError {
    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The gRPC status code carried by this error, if the driver produced one.
    pub fn code(&self) -> Option<Code> {
        match self {
            Self::Rpc(status) => Some(status.code()),
            _ => None,
        }
    }

    /// Returns `true` when the failed operation is known to have not
    /// happened and to not be running on the driver any more.
    ///
    /// Errors without a gRPC status never reached the driver (or the answer
    /// was lost), so they are never final.
    pub fn is_final(&self) -> bool {
        match self {
            Self::Rpc(status) => is_final_code(status.code()),
            _ => false,
        }
    }
}

impl From<Status> for CsiError {
    fn from(status: Status) -> Self {
        Self::Rpc(status)
    }
}

/// Classify a gRPC status code.
///
/// `Cancelled`, `DeadlineExceeded`, `Unavailable`, `ResourceExhausted` and
/// `Aborted` leave the operation possibly in flight on the driver; every
/// other code proves it did not succeed.
pub fn is_final_code(code: Code) -> bool {
    !matches!(
        code,
        Code::Cancelled
            | Code::DeadlineExceeded
            | Code::Unavailable
            | Code::ResourceExhausted
            | Code::Aborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_CODES: [Code; 17] = [
        Code::Ok,
        Code::Cancelled,
        Code::Unknown,
        Code::InvalidArgument,
        Code::DeadlineExceeded,
        Code::NotFound,
        Code::AlreadyExists,
        Code::PermissionDenied,
        Code::ResourceExhausted,
        Code::FailedPrecondition,
        Code::Aborted,
        Code::OutOfRange,
        Code::Unimplemented,
        Code::Internal,
        Code::Unavailable,
        Code::DataLoss,
        Code::Unauthenticated,
    ];

    #[test]
    fn error_display() {
        let err = CsiError::from(Status::not_found("volume vol-123 not found"));
        assert_eq!(
            err.to_string(),
            "rpc error: code = NotFound desc = volume vol-123 not found"
        );
    }

    #[test]
    fn transient_codes_are_not_final() {
        for code in [
            Code::Cancelled,
            Code::DeadlineExceeded,
            Code::Unavailable,
            Code::ResourceExhausted,
            Code::Aborted,
        ] {
            assert!(!is_final_code(code), "{code:?} must be transient");
        }
    }

    #[test]
    fn every_code_has_exactly_one_class() {
        let transient = ALL_CODES.iter().filter(|c| !is_final_code(**c)).count();
        let final_ = ALL_CODES.iter().filter(|c| is_final_code(**c)).count();
        assert_eq!(transient, 5);
        assert_eq!(transient + final_, ALL_CODES.len());
    }

    #[test]
    fn final_codes() {
        for code in [
            Code::NotFound,
            Code::PermissionDenied,
            Code::InvalidArgument,
            Code::FailedPrecondition,
            Code::Internal,
        ] {
            assert!(CsiError::from(Status::new(code, "boom")).is_final());
        }
    }

    #[test]
    fn errors_without_status_are_not_final() {
        assert!(!CsiError::transport("connection reset").is_final());
        assert!(!CsiError::InvalidArgument("empty volume id".into()).is_final());
        assert!(!CsiError::internal("oops").is_final());
        assert_eq!(CsiError::transport("x").code(), None);
    }
}
