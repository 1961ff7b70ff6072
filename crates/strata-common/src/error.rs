//! Error types for strata
//!
//! One error enum is shared by every tier; services convert it into a
//! `tonic::Status` at the RPC boundary and the proxy maps gRPC codes onto
//! HTTP statuses for clients.

use thiserror::Error;

/// Common result type for strata operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for strata
#[derive(Debug, Error)]
pub enum Error {
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Create a not found error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Check if this is a not found error
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidArgument(_) => tonic::Status::invalid_argument(message),
            Error::Unauthenticated(_) => tonic::Status::unauthenticated(message),
            Error::PermissionDenied(_) => tonic::Status::permission_denied(message),
            Error::NotFound(_) => tonic::Status::not_found(message),
            Error::AlreadyExists(_) => tonic::Status::already_exists(message),
            Error::Unavailable(_) => tonic::Status::unavailable(message),
            Error::DiskIo(_) | Error::Configuration(_) | Error::Internal(_) => {
                tonic::Status::internal(message)
            }
        }
    }
}

/// Map a gRPC status code onto the HTTP status surfaced to clients.
///
/// RPC errors bubble through the proxy verbatim; this is the single place
/// where their codes are translated.
#[must_use]
pub fn http_status(code: tonic::Code) -> u16 {
    match code {
        tonic::Code::Ok => 200,
        tonic::Code::InvalidArgument | tonic::Code::OutOfRange => 400,
        tonic::Code::Unauthenticated => 401,
        tonic::Code::PermissionDenied => 403,
        tonic::Code::NotFound => 404,
        tonic::Code::AlreadyExists | tonic::Code::Aborted => 409,
        tonic::Code::ResourceExhausted => 429,
        tonic::Code::Unimplemented => 501,
        tonic::Code::Unavailable => 503,
        tonic::Code::DeadlineExceeded => 504,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_conversion() {
        let status: tonic::Status = Error::invalid_argument("bad offset").into();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("bad offset"));

        let status: tonic::Status = Error::not_found("no such key").into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn test_io_error_is_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let status: tonic::Status = Error::from(io).into();
        assert_eq!(status.code(), tonic::Code::Internal);
    }

    #[test]
    fn test_http_status() {
        assert_eq!(http_status(tonic::Code::InvalidArgument), 400);
        assert_eq!(http_status(tonic::Code::Unauthenticated), 401);
        assert_eq!(http_status(tonic::Code::PermissionDenied), 403);
        assert_eq!(http_status(tonic::Code::NotFound), 404);
        assert_eq!(http_status(tonic::Code::Unavailable), 503);
        assert_eq!(http_status(tonic::Code::Internal), 500);
    }
}
