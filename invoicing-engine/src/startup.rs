use axum::{
    middleware::from_fn,
    routing::{get, post},
    Router,
};
use service_core::middleware::tracing::request_id_middleware;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{
    app::health_check,
    documents::{
        create_credit_note, create_document, create_rectificative, delete_document,
        duplicate_document, edit_document, get_document, list_documents, validate_document,
    },
    metrics::metrics,
    payments::{list_payments, record_payment},
};
use crate::services::Database;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
}

pub fn build_router(db: Arc<Database>) -> Router {
    let state = AppState { db };

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .route(
            "/tenants/:tenant_id/documents",
            post(create_document).get(list_documents),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id",
            get(get_document)
                .put(edit_document)
                .delete(delete_document),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id/validate",
            post(validate_document),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id/duplicate",
            post(duplicate_document),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id/credit-notes",
            post(create_credit_note),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id/rectify",
            post(create_rectificative),
        )
        .route(
            "/tenants/:tenant_id/documents/:document_id/payments",
            post(record_payment).get(list_payments),
        )
        .layer(CorsLayer::permissive())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .layer(from_fn(request_id_middleware))
        .with_state(state)
}
