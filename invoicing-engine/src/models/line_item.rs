//! Line item model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A stored document line. Quantities are signed: negative on credit notes.
/// Lines are replaced wholesale on every draft edit, never patched in place.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LineItem {
    pub line_item_id: Uuid,
    pub document_id: Uuid,
    pub tenant_id: Uuid,
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub discount_pct: Decimal,
    pub vat_rate: Decimal,
    pub total_excl_tax: Decimal,
    pub total_tax: Decimal,
    pub total_incl_tax: Decimal,
    /// Cumulative quantity already negated by credit notes.
    pub credited_quantity: Decimal,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

impl LineItem {
    /// Quantity still available for partial crediting.
    pub fn remaining_quantity(&self) -> Decimal {
        self.quantity - self.credited_quantity
    }
}

/// Caller-supplied line input; the three monetary totals are always derived
/// by the calculator, never hand-entered.
#[derive(Debug, Clone)]
pub struct LineItemInput {
    pub description: String,
    pub quantity: Decimal,
    pub unit: Option<String>,
    pub unit_price: Decimal,
    pub discount_pct: Decimal,
    pub vat_rate: Decimal,
}
