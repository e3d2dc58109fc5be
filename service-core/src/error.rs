use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// Error taxonomy for the document engine.
///
/// Every operation returns a typed result; the financial-derivation code
/// never uses panics for normal control flow. `Concurrency` is the only
/// retryable variant: the caller re-issues the whole operation.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Validation error: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Bad request: {0}")]
    BadRequest(anyhow::Error),

    #[error("Not found: {0}")]
    NotFound(anyhow::Error),

    #[error("State conflict: {0}")]
    StateConflict(anyhow::Error),

    #[error("Exercise closed: {0}")]
    ExerciseClosed(anyhow::Error),

    #[error("Concurrent update, retry: {0}")]
    Concurrency(anyhow::Error),

    #[error("Database error: {0}")]
    DatabaseError(anyhow::Error),

    #[error("Internal server error: {0}")]
    InternalError(#[from] anyhow::Error),
}

impl AppError {
    /// Stable label used for error metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::ValidationError(_) => "validation",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::StateConflict(_) => "state_conflict",
            AppError::ExerciseClosed(_) => "exercise_closed",
            AppError::Concurrency(_) => "concurrency",
            AppError::DatabaseError(_) => "database",
            AppError::InternalError(_) => "internal",
        }
    }

    /// Whether re-issuing the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Concurrency(_))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            kind: &'static str,
            #[serde(skip_serializing_if = "Option::is_none")]
            details: Option<String>,
        }

        let kind = self.kind();
        let retryable = self.is_retryable();

        let (status, error_message, details) = match self {
            AppError::ValidationError(err) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "Validation error".to_string(),
                Some(err.to_string()),
            ),
            AppError::BadRequest(err) => (StatusCode::BAD_REQUEST, err.to_string(), None),
            AppError::NotFound(err) => (StatusCode::NOT_FOUND, err.to_string(), None),
            AppError::StateConflict(err) => (StatusCode::CONFLICT, err.to_string(), None),
            AppError::ExerciseClosed(err) => (StatusCode::CONFLICT, err.to_string(), None),
            AppError::Concurrency(err) => (StatusCode::SERVICE_UNAVAILABLE, err.to_string(), None),
            AppError::DatabaseError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                Some(err.to_string()),
            ),
            AppError::InternalError(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                Some(err.to_string()),
            ),
        };

        let mut res = (
            status,
            Json(ErrorResponse {
                error: error_message,
                kind,
                details,
            }),
        )
            .into_response();

        if retryable {
            res.headers_mut()
                .insert(axum::http::header::RETRY_AFTER, 1.into());
        }

        res
    }
}
