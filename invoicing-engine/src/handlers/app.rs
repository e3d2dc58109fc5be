use axum::extract::State;
use axum::http::StatusCode;

use crate::startup::AppState;

/// Liveness/readiness probe: verifies the database connection.
pub async fn health_check(State(state): State<AppState>) -> Result<&'static str, StatusCode> {
    match state.db.health_check().await {
        Ok(()) => Ok("OK"),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}
