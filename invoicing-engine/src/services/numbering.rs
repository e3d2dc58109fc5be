//! Gapless document numbering.
//!
//! One counter row per (company, fiscal year, family), created lazily and
//! incremented with an upsert inside the caller's transaction. The row-level
//! lock taken by the conflicting update serializes concurrent allocations
//! for the same key; if the enclosing transaction aborts, the increment
//! rolls back with it. Numbers are never reused, even when the document that
//! consumed one is later deleted.

use service_core::error::AppError;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::models::DocumentFamily;
use crate::services::database::map_db_err;

/// Format a document number, bit-exact: `{prefix}-{year}-{number}` with the
/// sequence zero-padded to 5 digits, e.g. `FAC-2026-00001`.
pub fn format_document_number(family: DocumentFamily, fiscal_year: i32, number: i64) -> String {
    format!("{}-{}-{:05}", family.prefix(), fiscal_year, number)
}

/// Allocate the next number for a (company, fiscal year, family) key.
///
/// Must be called inside the same transaction as the document insert so the
/// increment and the insert commit or roll back together.
pub async fn allocate(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    fiscal_year: i32,
    family: DocumentFamily,
) -> Result<String, AppError> {
    let number: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO sequence_counters (tenant_id, fiscal_year, family, last_number)
        VALUES ($1, $2, $3, 1)
        ON CONFLICT (tenant_id, fiscal_year, family)
        DO UPDATE SET last_number = sequence_counters.last_number + 1
        RETURNING last_number
        "#,
    )
    .bind(tenant_id)
    .bind(fiscal_year)
    .bind(family)
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to allocate document number", e))?;

    Ok(format_document_number(family, fiscal_year, number))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_numbers_use_the_fac_prefix() {
        assert_eq!(
            format_document_number(DocumentFamily::Invoice, 2026, 1),
            "FAC-2026-00001"
        );
    }

    #[test]
    fn credit_note_numbers_use_the_av_prefix() {
        assert_eq!(
            format_document_number(DocumentFamily::CreditNote, 2026, 42),
            "AV-2026-00042"
        );
    }

    #[test]
    fn padding_grows_past_five_digits() {
        assert_eq!(
            format_document_number(DocumentFamily::Invoice, 2026, 123_456),
            "FAC-2026-123456"
        );
    }
}
