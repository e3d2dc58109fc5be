//! Document operation handlers: create, read, edit, delete, validate,
//! duplicate, credit notes and rectificatives.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use tracing::instrument;
use uuid::Uuid;
use validator::Validate;

use crate::handlers::observe;
use crate::models::{
    CreateDocument, CreditNoteMode, Document, DocumentType, EditDocument, InvoiceKind,
    LifecycleState, LineItem, LineItemInput, ListDocumentsFilter,
};
use crate::services::metrics::HTTP_REQUEST_DURATION;
use crate::startup::AppState;

/// One caller-supplied document line.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct LineItemRequest {
    #[validate(length(min = 1, max = 512))]
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    #[serde(default)]
    pub discount_pct: Decimal,
    #[serde(default)]
    pub vat_rate: Decimal,
}

impl LineItemRequest {
    fn into_input(self) -> LineItemInput {
        LineItemInput {
            description: self.description,
            quantity: self.quantity,
            unit: self.unit,
            unit_price: self.unit_price,
            discount_pct: self.discount_pct,
            vat_rate: self.vat_rate,
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateDocumentRequest {
    pub client_id: Uuid,
    #[serde(default = "default_invoice_kind")]
    pub invoice_kind: InvoiceKind,
    #[validate(range(min = 2000, max = 2099))]
    pub fiscal_year: i32,
    pub currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    #[serde(default)]
    pub validate_immediately: bool,
    pub authorization_number: Option<String>,
    pub authorization_valid_until: Option<NaiveDate>,
    pub purchase_order_ref: Option<String>,
    pub notes: Option<String>,
    #[validate(nested)]
    pub lines: Vec<LineItemRequest>,
}

fn default_invoice_kind() -> InvoiceKind {
    InvoiceKind::Local
}

impl CreateDocumentRequest {
    fn into_input(self, tenant_id: Uuid) -> CreateDocument {
        CreateDocument {
            tenant_id,
            client_id: self.client_id,
            invoice_kind: self.invoice_kind,
            fiscal_year: self.fiscal_year,
            currency: self.currency,
            exchange_rate: self.exchange_rate,
            issue_date: self.issue_date,
            validate_immediately: self.validate_immediately,
            authorization_number: self.authorization_number,
            authorization_valid_until: self.authorization_valid_until,
            purchase_order_ref: self.purchase_order_ref,
            notes: self.notes,
            lines: self.lines.into_iter().map(LineItemRequest::into_input).collect(),
        }
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct EditDocumentRequest {
    pub client_id: Uuid,
    #[serde(default = "default_invoice_kind")]
    pub invoice_kind: InvoiceKind,
    pub currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    pub authorization_number: Option<String>,
    pub authorization_valid_until: Option<NaiveDate>,
    pub purchase_order_ref: Option<String>,
    pub notes: Option<String>,
    #[validate(nested)]
    pub lines: Vec<LineItemRequest>,
}

impl EditDocumentRequest {
    fn into_input(self) -> EditDocument {
        EditDocument {
            client_id: self.client_id,
            invoice_kind: self.invoice_kind,
            currency: self.currency,
            exchange_rate: self.exchange_rate,
            issue_date: self.issue_date,
            authorization_number: self.authorization_number,
            authorization_valid_until: self.authorization_valid_until,
            purchase_order_ref: self.purchase_order_ref,
            notes: self.notes,
            lines: self.lines.into_iter().map(LineItemRequest::into_input).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RectifyRequest {
    #[serde(default)]
    pub validate_immediately: bool,
}

#[derive(Debug, Deserialize)]
pub struct ListDocumentsQuery {
    pub lifecycle_state: Option<LifecycleState>,
    pub document_type: Option<DocumentType>,
    pub client_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_page_size")]
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

fn default_page_size() -> i32 {
    20
}

/// A document with its stored lines; `warnings` carries the calculator's
/// VAT coercions back to the caller.
#[derive(Debug, Serialize)]
pub struct DocumentResponse {
    pub document: Document,
    pub line_items: Vec<LineItem>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ListDocumentsResponse {
    pub documents: Vec<Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_page_token: Option<Uuid>,
}

#[instrument(skip(state, request), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn create_document(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Json(request): Json<CreateDocumentRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>), AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["CreateDocument"])
        .start_timer();

    let result = async {
        request.validate()?;
        let input = request.into_input(tenant_id);
        let (document, line_items, warnings) = state.db.create_document(&input).await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings,
        })
    }
    .await;

    observe("CreateDocument", timer, result).map(|body| (StatusCode::CREATED, Json(body)))
}

#[instrument(skip(state), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn get_document(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DocumentResponse>, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["GetDocument"])
        .start_timer();

    let result = async {
        let document = state
            .db
            .get_document(tenant_id, document_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Document {} not found", document_id))
            })?;
        let line_items = state.db.get_line_items(tenant_id, document_id).await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings: Vec::new(),
        })
    }
    .await;

    observe("GetDocument", timer, result).map(Json)
}

#[instrument(skip(state, query), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn list_documents(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
    Query(query): Query<ListDocumentsQuery>,
) -> Result<Json<ListDocumentsResponse>, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["ListDocuments"])
        .start_timer();

    let page_size = query.page_size;
    let filter = ListDocumentsFilter {
        lifecycle_state: query.lifecycle_state,
        document_type: query.document_type,
        client_id: query.client_id,
        start_date: query.start_date,
        end_date: query.end_date,
        page_size,
        page_token: query.page_token,
    };

    let result = state.db.list_documents(tenant_id, &filter).await;
    let documents = observe("ListDocuments", timer, result)?;

    let next_page_token = if documents.len() == page_size.clamp(1, 100) as usize {
        documents.last().map(|d| d.document_id)
    } else {
        None
    };

    Ok(Json(ListDocumentsResponse {
        documents,
        next_page_token,
    }))
}

#[instrument(skip(state, request), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn edit_document(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<EditDocumentRequest>,
) -> Result<Json<DocumentResponse>, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["EditDocument"])
        .start_timer();

    let result = async {
        request.validate()?;
        let input = request.into_input();
        let (document, line_items, warnings) =
            state.db.edit_document(tenant_id, document_id, &input).await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings,
        })
    }
    .await;

    observe("EditDocument", timer, result).map(Json)
}

#[instrument(skip(state), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn delete_document(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["DeleteDocument"])
        .start_timer();

    let result = state.db.delete_document(tenant_id, document_id).await;
    observe("DeleteDocument", timer, result)?;

    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip(state), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn validate_document(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<DocumentResponse>, AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["ValidateDocument"])
        .start_timer();

    let result = async {
        let document = state.db.validate_document(tenant_id, document_id).await?;
        let line_items = state.db.get_line_items(tenant_id, document_id).await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings: Vec::new(),
        })
    }
    .await;

    observe("ValidateDocument", timer, result).map(Json)
}

#[instrument(skip(state), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn duplicate_document(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
) -> Result<(StatusCode, Json<DocumentResponse>), AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["DuplicateDocument"])
        .start_timer();

    let result = async {
        let (document, line_items) = state.db.duplicate_document(tenant_id, document_id).await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings: Vec::new(),
        })
    }
    .await;

    observe("DuplicateDocument", timer, result).map(|body| (StatusCode::CREATED, Json(body)))
}

#[instrument(skip(state, mode), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn create_credit_note(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
    Json(mode): Json<CreditNoteMode>,
) -> Result<(StatusCode, Json<DocumentResponse>), AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["CreateCreditNote"])
        .start_timer();

    let result = async {
        let (document, line_items) = state
            .db
            .create_credit_note(tenant_id, document_id, &mode)
            .await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings: Vec::new(),
        })
    }
    .await;

    observe("CreateCreditNote", timer, result).map(|body| (StatusCode::CREATED, Json(body)))
}

#[instrument(skip(state, request), fields(service = "invoicing-engine", tenant_id = %tenant_id))]
pub async fn create_rectificative(
    State(state): State<AppState>,
    Path((tenant_id, document_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<RectifyRequest>,
) -> Result<(StatusCode, Json<DocumentResponse>), AppError> {
    let timer = HTTP_REQUEST_DURATION
        .with_label_values(&["CreateRectificative"])
        .start_timer();

    let result = async {
        let (document, line_items) = state
            .db
            .create_rectificative(tenant_id, document_id, request.validate_immediately)
            .await?;
        Ok(DocumentResponse {
            document,
            line_items,
            warnings: Vec::new(),
        })
    }
    .await;

    observe("CreateRectificative", timer, result).map(|body| (StatusCode::CREATED, Json(body)))
}
