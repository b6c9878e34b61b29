//! HTTP error mapping.

use axum::Json;
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::alert::{EvaluationError, ResolutionError};
use crate::ingest::IngestError;
use crate::storage::StorageError;

/// Error returned by API handlers.
///
/// Rendered as `{"status": "error", "success": false, "message": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn unauthorized() -> Self {
        Self::Unauthorized("Unauthorized".to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = json!({
            "status": "error",
            "success": false,
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(what) => Self::NotFound(format!("{what} not found")),
            StorageError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::Validation(msg) => Self::BadRequest(msg),
            IngestError::Storage(e) => e.into(),
        }
    }
}

impl From<EvaluationError> for ApiError {
    fn from(err: EvaluationError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<ResolutionError> for ApiError {
    fn from(err: ResolutionError) -> Self {
        match err {
            ResolutionError::NotFound(_) => Self::NotFound(err.to_string()),
            ResolutionError::AlreadyResolved(_) => Self::Conflict(err.to_string()),
            ResolutionError::Storage(e) => e.into(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        Self::BadRequest(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    async fn render(err: ApiError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_error_body() {
        let (status, body) = render(ApiError::BadRequest("hostname is required".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["status"], "error");
        assert_eq!(body["success"], false);
        assert_eq!(body["message"], "hostname is required");
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let (status, _) = render(ResolutionError::NotFound(7).into()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = render(ResolutionError::AlreadyResolved(7).into()).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["message"], "alert event 7 is already resolved");

        let (status, _) = render(StorageError::Conflict("duplicate".into()).into()).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = render(IngestError::Validation("bad".into()).into()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = render(StorageError::Internal("disk".into()).into()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
