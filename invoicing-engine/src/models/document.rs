//! Document model: invoices, credit notes and rectificative invoices share
//! one record shape, distinguished by `document_type` and the back-reference
//! columns.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::models::line_item::LineItemInput;

/// Kind of document. Rectificative invoices are `Invoice` documents with
/// `rectifies_document_id` set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "document_type", rename_all = "snake_case")]
pub enum DocumentType {
    Invoice,
    CreditNote,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Invoice => "invoice",
            DocumentType::CreditNote => "credit_note",
        }
    }
}

/// VAT and stamp-duty regime of an invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "invoice_kind", rename_all = "snake_case")]
pub enum InvoiceKind {
    Local,
    Export,
    VatSuspended,
}

impl InvoiceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceKind::Local => "local",
            InvoiceKind::Export => "export",
            InvoiceKind::VatSuspended => "vat_suspended",
        }
    }

    /// Whether every line must carry a zero VAT rate.
    pub fn forces_zero_vat(&self) -> bool {
        matches!(self, InvoiceKind::Export | InvoiceKind::VatSuspended)
    }
}

/// Lifecycle axis. Drafts are editable; validated documents are immutable
/// and append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "lifecycle_state", rename_all = "snake_case")]
pub enum LifecycleState {
    Draft,
    Validated,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Draft => "draft",
            LifecycleState::Validated => "validated",
        }
    }
}

/// Payment axis, orthogonal to the lifecycle. Paid is only reachable from
/// validated documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "payment_state", rename_all = "snake_case")]
pub enum PaymentState {
    Unpaid,
    Paid,
}

impl PaymentState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentState::Unpaid => "unpaid",
            PaymentState::Paid => "paid",
        }
    }
}

/// Numbering family. Invoices and credit notes draw from independent
/// gapless sequences with distinct prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "document_family", rename_all = "snake_case")]
pub enum DocumentFamily {
    Invoice,
    CreditNote,
}

impl DocumentFamily {
    /// Human-facing number prefix, preserved bit-exact for compatibility.
    pub fn prefix(&self) -> &'static str {
        match self {
            DocumentFamily::Invoice => "FAC",
            DocumentFamily::CreditNote => "AV",
        }
    }
}

/// A billing document as stored. All monetary fields are derived by the
/// calculator at write time; readers only echo them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub document_number: String,
    pub document_type: DocumentType,
    pub invoice_kind: InvoiceKind,
    pub fiscal_year: i32,
    pub client_id: Uuid,
    pub client_name: String,
    pub currency: String,
    pub exchange_rate: Option<Decimal>,
    pub total_excl_tax: Decimal,
    pub total_tax: Decimal,
    pub stamp_duty: Decimal,
    pub total_incl_tax: Decimal,
    pub lifecycle_state: LifecycleState,
    pub payment_state: PaymentState,
    pub parent_document_id: Option<Uuid>,
    pub rectifies_document_id: Option<Uuid>,
    pub authorization_number: Option<String>,
    pub authorization_valid_until: Option<NaiveDate>,
    pub purchase_order_ref: Option<String>,
    pub notes: Option<String>,
    pub issue_date: NaiveDate,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
    pub validated_utc: Option<DateTime<Utc>>,
}

/// Input for creating a primary invoice.
#[derive(Debug, Clone)]
pub struct CreateDocument {
    pub tenant_id: Uuid,
    pub client_id: Uuid,
    pub invoice_kind: InvoiceKind,
    pub fiscal_year: i32,
    /// Defaults to the client's preferred currency when absent.
    pub currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    /// Create directly in the validated state (requires an open exercise).
    pub validate_immediately: bool,
    pub authorization_number: Option<String>,
    pub authorization_valid_until: Option<NaiveDate>,
    pub purchase_order_ref: Option<String>,
    pub notes: Option<String>,
    pub lines: Vec<LineItemInput>,
}

/// Input for editing a draft. The fiscal year is immutable because the
/// assigned document number embeds it.
#[derive(Debug, Clone)]
pub struct EditDocument {
    pub client_id: Uuid,
    pub invoice_kind: InvoiceKind,
    pub currency: Option<String>,
    pub exchange_rate: Option<Decimal>,
    pub issue_date: Option<NaiveDate>,
    pub authorization_number: Option<String>,
    pub authorization_valid_until: Option<NaiveDate>,
    pub purchase_order_ref: Option<String>,
    pub notes: Option<String>,
    pub lines: Vec<LineItemInput>,
}

/// Per-line selection for a partial credit note.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditLineSelection {
    pub line_item_id: Uuid,
    pub credit_quantity: Decimal,
}

/// Credit note derivation mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum CreditNoteMode {
    /// Negate every source line and the stamp duty.
    Total,
    /// Negate a proportional share of the selected lines.
    Partial { lines: Vec<CreditLineSelection> },
}

/// Filter parameters for listing documents.
#[derive(Debug, Clone, Default)]
pub struct ListDocumentsFilter {
    pub lifecycle_state: Option<LifecycleState>,
    pub document_type: Option<DocumentType>,
    pub client_id: Option<Uuid>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
