use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use arca_protocol::errors::{ErrorKind, ErrorResponse};
use arca_core::CoreError;
use arca_store::StoreError;

/// Server error type that maps to HTTP status codes and the fixed set of
/// client-visible error kinds.
#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    Conflict(String),
    BadRequest(String),
    PayloadTooLarge(String),
    Unprocessable(String),
    StoreFull(String),
    StoreUnavailable(String),
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StoreFull(_) => StatusCode::INSUFFICIENT_STORAGE,
            Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::AuthenticationFailed,
            Self::Forbidden(_) => ErrorKind::AuthenticationFailed,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::BadRequest(_) | Self::Unprocessable(_) | Self::PayloadTooLarge(_) => {
                ErrorKind::Conflict
            }
            Self::StoreFull(_) => ErrorKind::StoreFull,
            Self::StoreUnavailable(_) => ErrorKind::TransportUnavailable,
            Self::Internal(_) => ErrorKind::InternalError,
        }
    }

    fn message(&self) -> &str {
        match self {
            Self::Unauthorized(m)
            | Self::Forbidden(m)
            | Self::NotFound(m)
            | Self::Conflict(m)
            | Self::BadRequest(m)
            | Self::PayloadTooLarge(m)
            | Self::Unprocessable(m)
            | Self::StoreFull(m)
            | Self::StoreUnavailable(m)
            | Self::Internal(m) => m,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        // User errors are the caller's problem; only log server faults.
        if status.is_server_error() {
            tracing::error!(status = %status, error = %self.message());
        } else {
            tracing::debug!(status = %status, error = %self.message());
        }
        let body = ErrorResponse {
            kind: self.kind(),
            reason: self.message().to_string(),
            suggested_remedy: None,
        };
        (status, axum::Json(body)).into_response()
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::FileNotFound(_)
            | CoreError::StoreNotFound(_)
            | CoreError::LibrarianNotFound(_)
            | CoreError::TransferNotFound(_)
            | CoreError::UserNotFound(_) => ApiError::NotFound(e.to_string()),
            CoreError::FileConflict(_) | CoreError::InvalidTransition { .. } => {
                ApiError::Conflict(e.to_string())
            }
            CoreError::DeletionDisallowed(_) => ApiError::Forbidden(e.to_string()),
            CoreError::Store(store) => ApiError::from(store),
            CoreError::Config(m) => ApiError::BadRequest(m),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotEnoughSpace { .. } => ApiError::StoreFull(e.to_string()),
            StoreError::Disabled | StoreError::NotIngestible => ApiError::StoreFull(e.to_string()),
            StoreError::Unavailable => ApiError::StoreUnavailable(e.to_string()),
            StoreError::ChecksumMismatch { .. } => ApiError::Unprocessable(e.to_string()),
            StoreError::TargetExists(_) => ApiError::Conflict(e.to_string()),
            StoreError::UnsafePath(_) => ApiError::BadRequest(e.to_string()),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ApiError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => ApiError::NotFound(e.to_string()),
            _ => ApiError::Internal(e.to_string()),
        }
    }
}
