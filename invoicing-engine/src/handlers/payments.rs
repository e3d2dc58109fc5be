//! Payment ledger handlers.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use tracing::instrument;
use uuid::Uuid;

use crate::handlers::observe;
use crate::models::{Payment, PaymentMethod, RecordPayment};
use crate::services::metrics::HTTP_REQUEST_DURATION;
use crate::startup::AppState;

#[derive(Debug, Deserialize)]
pub struct RecordPaymentRequest {
    pub amount: Decimal,
    pub method: PaymentMethod,
    pub payment_date: NaiveDate,
    pub note: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListPaymentsResponse {
    pub payments: Vec<Payment>,
}

#[instrument(skip(state, request), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn record_payment(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<RecordPaymentRequest>,
) -> Result<(StatusCode, Json<Payment>), AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["RecordPayment"])
        .start_timer();

    let input = RecordPayment {
        amount: request.amount,
        method: request.method,
        payment_date: request.payment_date,
        note: request.note,
    };

    let result = state.db.record_payment(tenant_id, document_id, &input).await;
    observe("RecordPayment", timer, result).map(|payment| (StatusCode::CREATED, Json(payment)))
}

#[instrument(skip(state), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn list_payments(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<ListPaymentsResponse>, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["ListPayments"])
        .start_timer();

    let result = state.db.list_payments(tenant_id, document_id).await;
    let payments = observe("ListPayments", timer, result)?;

    Ok(Json(ListPaymentsResponse { payments }))
}
