//! Error kinds surfaced over RPC, and their mapping onto `tonic::Status`.

use thiserror::Error;

/// One variant per disposition in the broker's error handling design.
/// Converted to a `tonic::Status` at the RPC boundary; never retried
/// inside the broker.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    /// Wrong first message, or an unrecognised message variant mid-stream.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Unknown locator or token.
    #[error("not found: {0}")]
    NotFound(String),

    /// Secret mismatch.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Session-side cancelled mid-proxy (host vanished).
    #[error("aborted: {0}")]
    Aborted(String),

    /// Locator collision at registration.
    #[error("terminal refused: {0}")]
    TerminalRefused(String),

    /// Token collision, or the terminal is closing.
    #[error("session refused: {0}")]
    SessionRefused(String),

    /// Network send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<broker_core::Error> for ServiceError {
    fn from(err: broker_core::Error) -> Self {
        match err {
            broker_core::Error::DuplicateToken(_) => ServiceError::SessionRefused(err.to_string()),
            broker_core::Error::Closing => ServiceError::SessionRefused(err.to_string()),
            broker_core::Error::DuplicateLocator(_) => ServiceError::TerminalRefused(err.to_string()),
        }
    }
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::FailedPrecondition(msg) => tonic::Status::failed_precondition(msg),
            ServiceError::NotFound(msg) => tonic::Status::not_found(msg),
            ServiceError::PermissionDenied(msg) => tonic::Status::permission_denied(msg),
            ServiceError::Aborted(msg) => tonic::Status::aborted(msg),
            ServiceError::TerminalRefused(msg) => tonic::Status::internal(msg),
            ServiceError::SessionRefused(msg) => tonic::Status::internal(msg),
            ServiceError::Transport(msg) => tonic::Status::unavailable(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_locator_maps_to_terminal_refused() {
        let core_err = broker_core::Error::DuplicateLocator("loc".into());
        let service_err: ServiceError = core_err.into();
        assert!(matches!(service_err, ServiceError::TerminalRefused(_)));
    }

    #[test]
    fn closing_maps_to_session_refused() {
        let service_err: ServiceError = broker_core::Error::Closing.into();
        assert!(matches!(service_err, ServiceError::SessionRefused(_)));
    }

    #[test]
    fn not_found_maps_to_grpc_not_found_code() {
        let status: tonic::Status = ServiceError::NotFound("nope".into()).into();
        assert_eq!(status.code(), tonic::Code::NotFound);
    }

    #[test]
    fn permission_denied_maps_to_grpc_permission_denied_code() {
        let status: tonic::Status = ServiceError::PermissionDenied("bad secret".into()).into();
        assert_eq!(status.code(), tonic::Code::PermissionDenied);
    }
}
