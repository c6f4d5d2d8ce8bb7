//! HTTP error mapping.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tachyon_core::LifecycleError;
use thiserror::Error;

/// Errors returned by request handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// The `session_id` query parameter is absent or empty
    #[error("missing session_id")]
    MissingSessionId,

    /// The session id does not name a session this server could have issued
    #[error("unknown session id: {0}")]
    UnknownSession(String),

    /// The request body could not be decoded
    #[error("invalid request body: {0}")]
    InvalidBody(String),

    /// Failure reported by the lifecycle engine
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    ///
    /// - Bad input, invalid size, digest mismatch: 400 Bad Request
    /// - Unknown, verified or reaped session: 404 Not Found
    /// - Throttled client: 429 Too Many Requests
    /// - Storage failures: 500 Internal Server Error
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingSessionId | Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
            Self::UnknownSession(_) => StatusCode::NOT_FOUND,
            Self::Lifecycle(err) => match err {
                LifecycleError::InvalidSize(_)
                | LifecycleError::InvalidRequest(_)
                | LifecycleError::DigestMismatch => StatusCode::BAD_REQUEST,
                LifecycleError::SessionNotFound(_) => StatusCode::NOT_FOUND,
                LifecycleError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                LifecycleError::ArtifactCreation(_)
                | LifecycleError::ArtifactRead(_)
                | LifecycleError::ArtifactDeletionFailed { .. }
                | LifecycleError::TaskJoin(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Lifecycle(LifecycleError::RateLimited { retry_after }) => Some(*retry_after),
            _ => None,
        }
    }
}

/// Whole seconds to wait, rounded up and never zero
fn retry_after_secs(wait: Duration) -> u64 {
    let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    secs.max(1)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::debug!(%status, "Request rejected: {}", self);
        }

        // Server faults get a generic body; paths and io errors stay in the logs
        let body = match &self {
            Self::MissingSessionId => "Missing session_id".to_string(),
            Self::UnknownSession(_) => "Session not found".to_string(),
            Self::InvalidBody(_) => "Invalid request body".to_string(),
            Self::Lifecycle(err) => match err {
                LifecycleError::InvalidSize(_) => err.to_string(),
                LifecycleError::InvalidRequest(_) => "Invalid request".to_string(),
                LifecycleError::DigestMismatch => "Hash mismatch".to_string(),
                LifecycleError::SessionNotFound(_) => "Session not found".to_string(),
                LifecycleError::RateLimited { .. } => {
                    "Rate limit exceeded. Please wait before requesting another download session."
                        .to_string()
                }
                LifecycleError::ArtifactCreation(_)
                | LifecycleError::ArtifactRead(_)
                | LifecycleError::ArtifactDeletionFailed { .. }
                | LifecycleError::TaskJoin(_) => "Internal server error".to_string(),
            },
        };

        let mut response = (status, body).into_response();
        if let Some(wait) = self.retry_after() {
            response.headers_mut().insert(
                header::RETRY_AFTER,
                HeaderValue::from(retry_after_secs(wait)),
            );
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tachyon_core::SessionId;

    fn io_error() -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::PermissionDenied, "/srv/tmpdata/secret.bin")
    }

    #[test]
    fn test_error_status_codes() {
        assert_eq!(ApiError::MissingSessionId.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::UnknownSession("nope".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(LifecycleError::InvalidSize(7)).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(LifecycleError::DigestMismatch).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(LifecycleError::SessionNotFound(SessionId::new())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(LifecycleError::RateLimited {
                retry_after: Duration::from_secs(3)
            })
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiError::from(LifecycleError::ArtifactCreation(io_error())).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(LifecycleError::ArtifactDeletionFailed {
                id: SessionId::new(),
                source: io_error(),
            })
            .status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let response = ApiError::from(LifecycleError::RateLimited {
            retry_after: Duration::from_millis(2500),
        })
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "3");
    }

    #[test]
    fn test_retry_after_never_zero() {
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(10)), 10);
    }

    #[tokio::test]
    async fn test_error_responses_do_not_leak_details() {
        let response = ApiError::from(LifecycleError::ArtifactRead(io_error())).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(response.headers().get(header::RETRY_AFTER).is_none());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(body, "Internal server error");
        assert!(!body.contains("secret.bin"));
    }
}
