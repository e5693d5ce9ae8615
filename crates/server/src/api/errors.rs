use core::error::Error;

use error_stack::Report;
use metric_types::rpc::RpcCode;
use poem::http::StatusCode;
use storage::StoreError;
use tracing::error;

/// API errors
#[derive(Debug, derive_more::Display)]
pub enum ApiError {
    #[display("Server error: {message}")]
    ServerError { message: String },
}

impl Error for ApiError {}

pub fn status_of(err: &StoreError) -> StatusCode {
    match err {
        StoreError::BadName | StoreError::NotFound { .. } => StatusCode::NOT_FOUND,
        StoreError::BadKindType { .. }
        | StoreError::BadValue { .. }
        | StoreError::KindMismatch { .. } => StatusCode::BAD_REQUEST,
        StoreError::Persistence { .. }
        | StoreError::Database { .. }
        | StoreError::Connection { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn rpc_code_of(err: &StoreError) -> RpcCode {
    match err {
        StoreError::BadName | StoreError::NotFound { .. } => RpcCode::NotFound,
        StoreError::BadKindType { .. }
        | StoreError::BadValue { .. }
        | StoreError::KindMismatch { .. } => RpcCode::InvalidArgument,
        StoreError::Persistence { .. }
        | StoreError::Database { .. }
        | StoreError::Connection { .. } => RpcCode::Internal,
    }
}

/// Convert a store failure into a plain-text poem error.
///
/// Backend failures are logged with their full report and answered with a
/// generic message.
pub fn store_error(report: Report<StoreError>) -> poem::Error {
    let err = report.current_context();
    let status = status_of(err);
    if status.is_server_error() {
        error!("store operation failed: {report:?}");
        return poem::Error::from_string("internal storage error", status);
    }
    poem::Error::from_string(err.to_string(), status)
}

#[cfg(test)]
mod tests {
    use metric_types::MetricKind;

    use super::*;

    #[test]
    fn validation_errors_map_to_client_statuses() {
        assert_eq!(status_of(&StoreError::BadName), StatusCode::NOT_FOUND);
        assert_eq!(
            status_of(&StoreError::KindMismatch {
                name: "x".to_string(),
                bound: MetricKind::Gauge,
                incoming: MetricKind::Counter,
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&StoreError::BadKindType {
                kind: "summary".to_string()
            }),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(&StoreError::NotFound {
                name: "x".to_string()
            }),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn backend_errors_are_internal() {
        let err = StoreError::Connection {
            message: "refused".to_string(),
        };
        assert_eq!(status_of(&err), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(rpc_code_of(&err), RpcCode::Internal);
    }

    #[test]
    fn server_error_display_formatting() {
        let err = ApiError::ServerError {
            message: "bind failed".to_string(),
        };
        assert_eq!(err.to_string(), "Server error: bind failed");
    }
}
