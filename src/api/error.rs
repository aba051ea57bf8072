//! Mapping of job errors onto HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::error::DownloadError;

impl DownloadError {
    /// HTTP status for this error on most routes.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Admission { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            // Clients of this API treat "not ready" and "empty" as bad requests.
            Self::Conflict { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Client-facing message, without the job id prefix.
    pub fn public_message(&self) -> String {
        match self {
            Self::Conflict { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Build an error body with an explicit status.
pub fn error_response(status: StatusCode, err: &DownloadError) -> Response {
    (
        status,
        Json(serde_json::json!({
            "error": err.public_message(),
            "kind": err.kind(),
        })),
    )
        .into_response()
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        error_response(self.status_code(), &self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        assert_eq!(
            DownloadError::Validation("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            DownloadError::Admission { max: 1 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            DownloadError::NotFound { id: "a".into() }.status_code(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn conflict_message_drops_id() {
        let err = DownloadError::Conflict {
            id: "download_1_1".into(),
            reason: "No messages captured".into(),
        };
        assert_eq!(err.public_message(), "No messages captured");
    }
}
