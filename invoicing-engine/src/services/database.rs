//! Database service for the invoicing engine.
//!
//! Every mutating operation runs as a single transaction spanning the
//! sequence-counter increment (where applicable), the document upsert and
//! the line-item replacement. State checks happen inside the same
//! transaction as the subsequent write (`SELECT ... FOR UPDATE`), so two
//! concurrent writers serialize instead of overwriting each other.

use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::models::{
    ClientRecord, CreateDocument, CreditNoteMode, Document, DocumentFamily, DocumentType,
    EditDocument, InvoiceKind, LifecycleState, LineItem, LineItemInput, ListDocumentsFilter,
    Payment, RecordPayment,
};
use crate::services::calculator::{self, ComputedLine, CreditLine, HOME_CURRENCY};
use crate::services::metrics::{
    DB_QUERY_DURATION, DOCUMENTS_TOTAL, DOCUMENT_AMOUNT_TOTAL, PAYMENTS_TOTAL,
    PAYMENT_AMOUNT_TOTAL,
};
use crate::services::numbering;

const DOCUMENT_COLUMNS: &str = "document_id, tenant_id, document_number, document_type, \
    invoice_kind, fiscal_year, client_id, client_name, currency, exchange_rate, \
    total_excl_tax, total_tax, stamp_duty, total_incl_tax, lifecycle_state, payment_state, \
    parent_document_id, rectifies_document_id, authorization_number, authorization_valid_until, \
    purchase_order_ref, notes, issue_date, created_utc, updated_utc, validated_utc";

const LINE_ITEM_COLUMNS: &str = "line_item_id, document_id, tenant_id, description, quantity, \
    unit, unit_price, discount_pct, vat_rate, total_excl_tax, total_tax, total_incl_tax, \
    credited_quantity, sort_order, created_utc";

const PAYMENT_COLUMNS: &str =
    "payment_id, tenant_id, document_id, amount, currency, method, payment_date, note, created_utc";

/// Map a sqlx error, surfacing store-level serialization aborts and
/// deadlocks (SQLSTATE 40001 / 40P01) as retryable concurrency failures.
pub(crate) fn map_db_err(context: &str, e: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(ref db_err) = e {
        if matches!(db_err.code().as_deref(), Some("40001") | Some("40P01")) {
            return AppError::Concurrency(anyhow::anyhow!("{}: {}", context, e));
        }
    }
    AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "invoicing-engine"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_db_err("Health check failed", e))?;
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Document Operations
    // -------------------------------------------------------------------------

    /// Create a primary invoice, as a draft or directly validated.
    ///
    /// Validates the client reference, the suspension fields and the
    /// exchange rate, derives all monetary fields, allocates the document
    /// number and inserts the document with its lines atomically. Returns
    /// the stored document, its lines, and any VAT-coercion warnings.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn create_document(
        &self,
        input: &CreateDocument,
    ) -> Result<(Document, Vec<LineItem>, Vec<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_document"])
            .start_timer();

        validate_fiscal_year(input.fiscal_year)?;
        validate_lines(&input.lines)?;
        validate_suspension_fields(
            input.invoice_kind,
            input.authorization_number.as_deref(),
            input.authorization_valid_until.is_some(),
            input.purchase_order_ref.as_deref(),
        )?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let client = client_in_tx(&mut tx, input.tenant_id, input.client_id).await?;
        let currency = input
            .currency
            .clone()
            .unwrap_or_else(|| client.currency.clone());
        validate_exchange_rate(&currency, input.exchange_rate)?;

        let mut lines = input.lines.clone();
        let warnings = calculator::apply_vat_policy(input.invoice_kind, &mut lines);

        let computed: Vec<ComputedLine> = lines
            .iter()
            .map(|l| calculator::compute_line(l.quantity, l.unit_price, l.discount_pct, l.vat_rate))
            .collect();
        let (total_excl_tax, total_tax) = calculator::compute_document_totals(&computed);
        let stamp_duty = calculator::compute_stamp_duty(input.invoice_kind, &currency);
        let total_incl_tax = total_excl_tax + total_tax + stamp_duty;

        let lifecycle_state = if input.validate_immediately {
            ensure_exercise_open(&mut tx, input.tenant_id, input.fiscal_year).await?;
            LifecycleState::Validated
        } else {
            LifecycleState::Draft
        };

        let document_number = numbering::allocate(
            &mut tx,
            input.tenant_id,
            input.fiscal_year,
            DocumentFamily::Invoice,
        )
        .await?;

        let document_id = Uuid::new_v4();
        let issue_date = input
            .issue_date
            .unwrap_or_else(|| Utc::now().date_naive());

        let document = sqlx::query_as::<_, Document>(&format!(
            r#"
            INSERT INTO documents (
                document_id, tenant_id, document_number, document_type, invoice_kind,
                fiscal_year, client_id, client_name, currency, exchange_rate,
                total_excl_tax, total_tax, stamp_duty, total_incl_tax,
                lifecycle_state, payment_state,
                authorization_number, authorization_valid_until, purchase_order_ref,
                notes, issue_date, validated_utc
            )
            VALUES ($1, $2, $3, 'invoice', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    $14, 'unpaid', $15, $16, $17, $18, $19,
                    CASE WHEN $14 = 'validated'::lifecycle_state THEN NOW() ELSE NULL END)
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(document_id)
        .bind(input.tenant_id)
        .bind(&document_number)
        .bind(input.invoice_kind)
        .bind(input.fiscal_year)
        .bind(input.client_id)
        .bind(&client.name)
        .bind(&currency)
        .bind(input.exchange_rate)
        .bind(total_excl_tax)
        .bind(total_tax)
        .bind(stamp_duty)
        .bind(total_incl_tax)
        .bind(lifecycle_state)
        .bind(&input.authorization_number)
        .bind(input.authorization_valid_until)
        .bind(&input.purchase_order_ref)
        .bind(&input.notes)
        .bind(issue_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to insert document", e))?;

        let items = insert_computed_lines(&mut tx, &document, &lines, &computed).await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        DOCUMENTS_TOTAL
            .with_label_values(&["invoice", document.lifecycle_state.as_str()])
            .inc();
        DOCUMENT_AMOUNT_TOTAL
            .with_label_values(&[document.currency.as_str()])
            .inc_by(decimal_to_f64(document.total_incl_tax));

        info!(
            document_id = %document.document_id,
            document_number = %document.document_number,
            lifecycle_state = document.lifecycle_state.as_str(),
            "Document created"
        );

        Ok((document, items, warnings))
    }

    /// Get a document by ID.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn get_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<Option<Document>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_document"])
            .start_timer();

        let document = sqlx::query_as::<_, Document>(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE tenant_id = $1 AND document_id = $2"
        ))
        .bind(tenant_id)
        .bind(document_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_db_err("Failed to get document", e))?;

        timer.observe_duration();

        Ok(document)
    }

    /// Get line items for a document, in stored order.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn get_line_items(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<Vec<LineItem>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_line_items"])
            .start_timer();

        let items = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            SELECT {LINE_ITEM_COLUMNS}
            FROM line_items
            WHERE tenant_id = $1 AND document_id = $2
            ORDER BY sort_order, created_utc
            "#
        ))
        .bind(tenant_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_err("Failed to get line items", e))?;

        timer.observe_duration();

        Ok(items)
    }

    /// List documents for a company.
    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    pub async fn list_documents(
        &self,
        tenant_id: Uuid,
        filter: &ListDocumentsFilter,
    ) -> Result<Vec<Document>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_documents"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let documents = if let Some(cursor) = filter.page_token {
            sqlx::query_as::<_, Document>(&format!(
                r#"
                SELECT {DOCUMENT_COLUMNS}
                FROM documents
                WHERE tenant_id = $1
                  AND ($2::lifecycle_state IS NULL OR lifecycle_state = $2)
                  AND ($3::document_type IS NULL OR document_type = $3)
                  AND ($4::uuid IS NULL OR client_id = $4)
                  AND ($5::date IS NULL OR issue_date >= $5)
                  AND ($6::date IS NULL OR issue_date <= $6)
                  AND document_id > $7
                ORDER BY document_id
                LIMIT $8
                "#
            ))
            .bind(tenant_id)
            .bind(filter.lifecycle_state)
            .bind(filter.document_type)
            .bind(filter.client_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(cursor)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Document>(&format!(
                r#"
                SELECT {DOCUMENT_COLUMNS}
                FROM documents
                WHERE tenant_id = $1
                  AND ($2::lifecycle_state IS NULL OR lifecycle_state = $2)
                  AND ($3::document_type IS NULL OR document_type = $3)
                  AND ($4::uuid IS NULL OR client_id = $4)
                  AND ($5::date IS NULL OR issue_date >= $5)
                  AND ($6::date IS NULL OR issue_date <= $6)
                ORDER BY document_id
                LIMIT $7
                "#
            ))
            .bind(tenant_id)
            .bind(filter.lifecycle_state)
            .bind(filter.document_type)
            .bind(filter.client_id)
            .bind(filter.start_date)
            .bind(filter.end_date)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| map_db_err("Failed to list documents", e))?;

        timer.observe_duration();

        Ok(documents)
    }

    /// Edit a draft: replaces all line items and recomputes totals.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn edit_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        input: &EditDocument,
    ) -> Result<(Document, Vec<LineItem>, Vec<String>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["edit_document"])
            .start_timer();

        validate_lines(&input.lines)?;
        validate_suspension_fields(
            input.invoice_kind,
            input.authorization_number.as_deref(),
            input.authorization_valid_until.is_some(),
            input.purchase_order_ref.as_deref(),
        )?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let existing = lock_document(&mut tx, tenant_id, document_id).await?;
        if existing.lifecycle_state != LifecycleState::Draft {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only draft documents can be edited; {} is validated",
                existing.document_number
            )));
        }

        let client = client_in_tx(&mut tx, tenant_id, input.client_id).await?;
        let currency = input
            .currency
            .clone()
            .unwrap_or_else(|| client.currency.clone());
        validate_exchange_rate(&currency, input.exchange_rate)?;

        let mut lines = input.lines.clone();
        let warnings = calculator::apply_vat_policy(input.invoice_kind, &mut lines);

        let computed: Vec<ComputedLine> = lines
            .iter()
            .map(|l| calculator::compute_line(l.quantity, l.unit_price, l.discount_pct, l.vat_rate))
            .collect();
        let (total_excl_tax, total_tax) = calculator::compute_document_totals(&computed);
        let stamp_duty = calculator::compute_stamp_duty(input.invoice_kind, &currency);
        let total_incl_tax = total_excl_tax + total_tax + stamp_duty;

        // Wholesale replacement: delete and reinsert, never patch in place.
        sqlx::query("DELETE FROM line_items WHERE tenant_id = $1 AND document_id = $2")
            .bind(tenant_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to delete line items", e))?;

        let issue_date = input.issue_date.unwrap_or(existing.issue_date);

        let document = sqlx::query_as::<_, Document>(&format!(
            r#"
            UPDATE documents
            SET client_id = $3,
                client_name = $4,
                invoice_kind = $5,
                currency = $6,
                exchange_rate = $7,
                total_excl_tax = $8,
                total_tax = $9,
                stamp_duty = $10,
                total_incl_tax = $11,
                authorization_number = $12,
                authorization_valid_until = $13,
                purchase_order_ref = $14,
                notes = $15,
                issue_date = $16,
                updated_utc = NOW()
            WHERE tenant_id = $1 AND document_id = $2
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(document_id)
        .bind(input.client_id)
        .bind(&client.name)
        .bind(input.invoice_kind)
        .bind(&currency)
        .bind(input.exchange_rate)
        .bind(total_excl_tax)
        .bind(total_tax)
        .bind(stamp_duty)
        .bind(total_incl_tax)
        .bind(&input.authorization_number)
        .bind(input.authorization_valid_until)
        .bind(&input.purchase_order_ref)
        .bind(&input.notes)
        .bind(issue_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to update document", e))?;

        let items = insert_computed_lines(&mut tx, &document, &lines, &computed).await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        info!(
            document_id = %document.document_id,
            document_number = %document.document_number,
            "Document edited"
        );

        Ok((document, items, warnings))
    }

    /// Delete a draft. Validated documents are immutable for audit
    /// integrity; their line items cascade with the document row.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn delete_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["delete_document"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let existing = lock_document(&mut tx, tenant_id, document_id).await?;
        if existing.lifecycle_state != LifecycleState::Draft {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only draft documents can be deleted; {} is validated",
                existing.document_number
            )));
        }

        sqlx::query("DELETE FROM documents WHERE tenant_id = $1 AND document_id = $2")
            .bind(tenant_id)
            .bind(document_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to delete document", e))?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        info!(
            document_id = %document_id,
            document_number = %existing.document_number,
            "Draft document deleted"
        );

        Ok(())
    }

    /// Validate a draft: irreversible, stamps `validated_utc` exactly once,
    /// and requires the document's fiscal exercise to be open.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn validate_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<Document, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["validate_document"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let existing = lock_document(&mut tx, tenant_id, document_id).await?;
        if existing.lifecycle_state != LifecycleState::Draft {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Document {} is already validated",
                existing.document_number
            )));
        }

        ensure_exercise_open(&mut tx, tenant_id, existing.fiscal_year).await?;

        let document = sqlx::query_as::<_, Document>(&format!(
            r#"
            UPDATE documents
            SET lifecycle_state = 'validated',
                validated_utc = NOW(),
                updated_utc = NOW()
            WHERE tenant_id = $1 AND document_id = $2
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(tenant_id)
        .bind(document_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to validate document", e))?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        DOCUMENTS_TOTAL
            .with_label_values(&[document.document_type.as_str(), "validated"])
            .inc();

        info!(
            document_id = %document.document_id,
            document_number = %document.document_number,
            "Document validated"
        );

        Ok(document)
    }

    /// Duplicate a draft: a brand-new draft with a freshly allocated
    /// number, lines copied verbatim, dated now.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn duplicate_document(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<(Document, Vec<LineItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["duplicate_document"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let source = lock_document(&mut tx, tenant_id, document_id).await?;
        if source.lifecycle_state != LifecycleState::Draft {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only draft documents can be duplicated; {} is validated",
                source.document_number
            )));
        }

        let source_lines = line_items_in_tx(&mut tx, tenant_id, document_id).await?;

        let family = match source.document_type {
            DocumentType::Invoice => DocumentFamily::Invoice,
            DocumentType::CreditNote => DocumentFamily::CreditNote,
        };
        let document_number =
            numbering::allocate(&mut tx, tenant_id, source.fiscal_year, family).await?;

        let document =
            insert_document_copy(&mut tx, &source, &document_number, CopyKind::Duplicate).await?;
        let items = copy_line_items(&mut tx, &document, &source_lines).await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        DOCUMENTS_TOTAL
            .with_label_values(&[document.document_type.as_str(), "draft"])
            .inc();

        info!(
            source_document_id = %document_id,
            document_id = %document.document_id,
            document_number = %document.document_number,
            "Document duplicated"
        );

        Ok((document, items))
    }

    // -------------------------------------------------------------------------
    // Credit Note Operations
    // -------------------------------------------------------------------------

    /// Derive a credit note from a validated invoice.
    ///
    /// The credit note is created already validated, with a fresh
    /// credit-note-family number and `parent_document_id` set. The source
    /// document's amounts and lines are never modified, except the
    /// `credited_quantity` bookkeeping counter that guards against
    /// cumulative over-crediting.
    #[instrument(skip(self, mode), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn create_credit_note(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        mode: &CreditNoteMode,
    ) -> Result<(Document, Vec<LineItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_credit_note"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let source = lock_document(&mut tx, tenant_id, document_id).await?;
        if source.document_type != DocumentType::Invoice {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Credit notes cannot target credit notes ({})",
                source.document_number
            )));
        }
        if source.lifecycle_state != LifecycleState::Validated {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only validated invoices can be credited; {} is a draft",
                source.document_number
            )));
        }

        let source_lines = line_items_in_tx(&mut tx, tenant_id, document_id).await?;

        // Derive the credited lines and the stamp duty share.
        let (credit_lines, stamp_duty) = match mode {
            CreditNoteMode::Total => {
                if source_lines
                    .iter()
                    .any(|l| !l.credited_quantity.is_zero())
                {
                    return Err(AppError::StateConflict(anyhow::anyhow!(
                        "Invoice {} already has credited lines; use a partial credit note",
                        source.document_number
                    )));
                }

                let credits: Vec<(LineItem, CreditLine)> = source_lines
                    .iter()
                    .map(|l| (l.clone(), calculator::negate_line(l)))
                    .collect();

                for line in &source_lines {
                    mark_credited(&mut tx, tenant_id, line.line_item_id, line.quantity).await?;
                }

                (credits, -source.stamp_duty)
            }
            CreditNoteMode::Partial { lines: selections } => {
                if selections.is_empty() {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Partial credit note requires at least one selected line"
                    )));
                }

                let mut seen = HashSet::new();
                for selection in selections {
                    if !seen.insert(selection.line_item_id) {
                        return Err(AppError::BadRequest(anyhow::anyhow!(
                            "Line {} selected more than once",
                            selection.line_item_id
                        )));
                    }
                }

                let mut credits = Vec::with_capacity(selections.len());
                for selection in selections {
                    let line = source_lines
                        .iter()
                        .find(|l| l.line_item_id == selection.line_item_id)
                        .ok_or_else(|| {
                            AppError::NotFound(anyhow::anyhow!(
                                "Line {} not found on invoice {}",
                                selection.line_item_id,
                                source.document_number
                            ))
                        })?;

                    let credit = calculator::prorate_line(line, selection.credit_quantity)?;
                    mark_credited(
                        &mut tx,
                        tenant_id,
                        line.line_item_id,
                        selection.credit_quantity,
                    )
                    .await?;
                    credits.push((line.clone(), credit));
                }

                (credits, Decimal::ZERO)
            }
        };

        let total_excl_tax: Decimal = credit_lines.iter().map(|(_, c)| c.total_excl_tax).sum();
        let total_tax: Decimal = credit_lines.iter().map(|(_, c)| c.total_tax).sum();
        let total_incl_tax = total_excl_tax + total_tax + stamp_duty;

        let document_number = numbering::allocate(
            &mut tx,
            tenant_id,
            source.fiscal_year,
            DocumentFamily::CreditNote,
        )
        .await?;

        let credit_note_id = Uuid::new_v4();
        let document = sqlx::query_as::<_, Document>(&format!(
            r#"
            INSERT INTO documents (
                document_id, tenant_id, document_number, document_type, invoice_kind,
                fiscal_year, client_id, client_name, currency, exchange_rate,
                total_excl_tax, total_tax, stamp_duty, total_incl_tax,
                lifecycle_state, payment_state, parent_document_id,
                authorization_number, authorization_valid_until, purchase_order_ref,
                issue_date, validated_utc
            )
            VALUES ($1, $2, $3, 'credit_note', $4, $5, $6, $7, $8, $9, $10, $11, $12, $13,
                    'validated', 'unpaid', $14, $15, $16, $17, $18, NOW())
            RETURNING {DOCUMENT_COLUMNS}
            "#
        ))
        .bind(credit_note_id)
        .bind(tenant_id)
        .bind(&document_number)
        .bind(source.invoice_kind)
        .bind(source.fiscal_year)
        .bind(source.client_id)
        .bind(&source.client_name)
        .bind(&source.currency)
        .bind(source.exchange_rate)
        .bind(total_excl_tax)
        .bind(total_tax)
        .bind(stamp_duty)
        .bind(total_incl_tax)
        .bind(source.document_id)
        .bind(&source.authorization_number)
        .bind(source.authorization_valid_until)
        .bind(&source.purchase_order_ref)
        .bind(Utc::now().date_naive())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to insert credit note", e))?;

        let mut items = Vec::with_capacity(credit_lines.len());
        for (index, (source_line, credit)) in credit_lines.iter().enumerate() {
            let item = sqlx::query_as::<_, LineItem>(&format!(
                r#"
                INSERT INTO line_items (
                    line_item_id, document_id, tenant_id, description, quantity, unit,
                    unit_price, discount_pct, vat_rate,
                    total_excl_tax, total_tax, total_incl_tax, sort_order
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                RETURNING {LINE_ITEM_COLUMNS}
                "#
            ))
            .bind(Uuid::new_v4())
            .bind(document.document_id)
            .bind(tenant_id)
            .bind(&source_line.description)
            .bind(credit.quantity)
            .bind(&source_line.unit)
            .bind(source_line.unit_price)
            .bind(source_line.discount_pct)
            .bind(source_line.vat_rate)
            .bind(credit.total_excl_tax)
            .bind(credit.total_tax)
            .bind(credit.total_incl_tax)
            .bind(index as i32)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_db_err("Failed to insert credit note line", e))?;
            items.push(item);
        }

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        DOCUMENTS_TOTAL
            .with_label_values(&["credit_note", "validated"])
            .inc();

        info!(
            source_document_id = %document_id,
            credit_note_id = %document.document_id,
            credit_note_number = %document.document_number,
            total_incl_tax = %document.total_incl_tax,
            "Credit note created"
        );

        Ok((document, items))
    }

    // -------------------------------------------------------------------------
    // Rectificative Operations
    // -------------------------------------------------------------------------

    /// Open a rectificative invoice for a validated source: an independent,
    /// fully editable document pre-populated with a snapshot of the source,
    /// linked through `rectifies_document_id`. The source is read-only
    /// input and is never mutated.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn create_rectificative(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        validate_immediately: bool,
    ) -> Result<(Document, Vec<LineItem>), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_rectificative"])
            .start_timer();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let source = lock_document(&mut tx, tenant_id, document_id).await?;
        if source.document_type != DocumentType::Invoice {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only invoices can be rectified ({})",
                source.document_number
            )));
        }
        if source.lifecycle_state != LifecycleState::Validated {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Only validated invoices can be rectified; {} is a draft",
                source.document_number
            )));
        }

        if validate_immediately {
            ensure_exercise_open(&mut tx, tenant_id, source.fiscal_year).await?;
        }

        let source_lines = line_items_in_tx(&mut tx, tenant_id, document_id).await?;

        let document_number = numbering::allocate(
            &mut tx,
            tenant_id,
            source.fiscal_year,
            DocumentFamily::Invoice,
        )
        .await?;

        let copy_kind = if validate_immediately {
            CopyKind::RectificativeValidated
        } else {
            CopyKind::Rectificative
        };
        let document = insert_document_copy(&mut tx, &source, &document_number, copy_kind).await?;
        let items = copy_line_items(&mut tx, &document, &source_lines).await?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        DOCUMENTS_TOTAL
            .with_label_values(&["invoice", document.lifecycle_state.as_str()])
            .inc();

        info!(
            source_document_id = %document_id,
            document_id = %document.document_id,
            document_number = %document.document_number,
            "Rectificative invoice created"
        );

        Ok((document, items))
    }

    // -------------------------------------------------------------------------
    // Payment Operations
    // -------------------------------------------------------------------------

    /// Record a payment event against a validated document and flip its
    /// payment state in the same transaction. Amounts are not reconciled
    /// against the document total: the ledger records events for audit.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn record_payment(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
        input: &RecordPayment,
    ) -> Result<Payment, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["record_payment"])
            .start_timer();

        if input.amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Payment amount must be positive, got {}",
                input.amount
            )));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_db_err("Failed to begin transaction", e))?;

        let document = lock_document(&mut tx, tenant_id, document_id).await?;
        if document.lifecycle_state != LifecycleState::Validated {
            return Err(AppError::StateConflict(anyhow::anyhow!(
                "Payments can only be recorded against validated documents; {} is a draft",
                document.document_number
            )));
        }

        let payment = sqlx::query_as::<_, Payment>(&format!(
            r#"
            INSERT INTO payments (
                payment_id, tenant_id, document_id, amount, currency, method,
                payment_date, note
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(document_id)
        .bind(calculator::round_money(input.amount))
        .bind(&document.currency)
        .bind(input.method)
        .bind(input.payment_date)
        .bind(&input.note)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to insert payment", e))?;

        sqlx::query(
            r#"
            UPDATE documents
            SET payment_state = 'paid', updated_utc = NOW()
            WHERE tenant_id = $1 AND document_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(document_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_db_err("Failed to update payment state", e))?;

        tx.commit()
            .await
            .map_err(|e| map_db_err("Failed to commit transaction", e))?;

        timer.observe_duration();

        PAYMENTS_TOTAL
            .with_label_values(&[payment.method.as_str()])
            .inc();
        PAYMENT_AMOUNT_TOTAL
            .with_label_values(&[payment.currency.as_str()])
            .inc_by(decimal_to_f64(payment.amount));

        info!(
            payment_id = %payment.payment_id,
            document_id = %document_id,
            amount = %payment.amount,
            "Payment recorded"
        );

        Ok(payment)
    }

    /// List payment events recorded against a document.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, document_id = %document_id))]
    pub async fn list_payments(
        &self,
        tenant_id: Uuid,
        document_id: Uuid,
    ) -> Result<Vec<Payment>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_payments"])
            .start_timer();

        self.get_document(tenant_id, document_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Document {} not found", document_id))
            })?;

        let payments = sqlx::query_as::<_, Payment>(&format!(
            r#"
            SELECT {PAYMENT_COLUMNS}
            FROM payments
            WHERE tenant_id = $1 AND document_id = $2
            ORDER BY payment_date, created_utc
            "#
        ))
        .bind(tenant_id)
        .bind(document_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_db_err("Failed to list payments", e))?;

        timer.observe_duration();

        Ok(payments)
    }
}

// -------------------------------------------------------------------------
// Transaction-scoped helpers
// -------------------------------------------------------------------------

/// Read a document under `FOR UPDATE` so the state check and the write it
/// precedes are serialized against concurrent writers.
async fn lock_document(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    document_id: Uuid,
) -> Result<Document, AppError> {
    sqlx::query_as::<_, Document>(&format!(
        "SELECT {DOCUMENT_COLUMNS} FROM documents \
         WHERE tenant_id = $1 AND document_id = $2 FOR UPDATE"
    ))
    .bind(tenant_id)
    .bind(document_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to lock document", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Document {} not found", document_id)))
}

async fn client_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    client_id: Uuid,
) -> Result<ClientRecord, AppError> {
    sqlx::query_as::<_, ClientRecord>(
        "SELECT client_id, tenant_id, name, tax_id, currency, created_utc \
         FROM clients WHERE tenant_id = $1 AND client_id = $2",
    )
    .bind(tenant_id)
    .bind(client_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to get client", e))?
    .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Client {} not found", client_id)))
}

async fn line_items_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    document_id: Uuid,
) -> Result<Vec<LineItem>, AppError> {
    sqlx::query_as::<_, LineItem>(&format!(
        r#"
        SELECT {LINE_ITEM_COLUMNS}
        FROM line_items
        WHERE tenant_id = $1 AND document_id = $2
        ORDER BY sort_order, created_utc
        "#
    ))
    .bind(tenant_id)
    .bind(document_id)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to get line items", e))
}

/// Fail unless the company has an open fiscal exercise for the year.
async fn ensure_exercise_open(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    fiscal_year: i32,
) -> Result<(), AppError> {
    let is_open: Option<bool> = sqlx::query_scalar(
        "SELECT is_open FROM fiscal_exercises WHERE tenant_id = $1 AND fiscal_year = $2",
    )
    .bind(tenant_id)
    .bind(fiscal_year)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to check fiscal exercise", e))?;

    match is_open {
        Some(true) => Ok(()),
        Some(false) => Err(AppError::ExerciseClosed(anyhow::anyhow!(
            "Fiscal exercise {} is closed",
            fiscal_year
        ))),
        None => Err(AppError::ExerciseClosed(anyhow::anyhow!(
            "No fiscal exercise declared for {}",
            fiscal_year
        ))),
    }
}

/// Advance the cumulative credited quantity on a source line.
async fn mark_credited(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: Uuid,
    line_item_id: Uuid,
    credited: Decimal,
) -> Result<(), AppError> {
    sqlx::query(
        "UPDATE line_items SET credited_quantity = credited_quantity + $3 \
         WHERE tenant_id = $1 AND line_item_id = $2",
    )
    .bind(tenant_id)
    .bind(line_item_id)
    .bind(credited)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to update credited quantity", e))?;
    Ok(())
}

/// Insert freshly computed line items for a document.
async fn insert_computed_lines(
    tx: &mut Transaction<'_, Postgres>,
    document: &Document,
    lines: &[LineItemInput],
    computed: &[ComputedLine],
) -> Result<Vec<LineItem>, AppError> {
    let mut items = Vec::with_capacity(lines.len());
    for (index, (line, amounts)) in lines.iter().zip(computed).enumerate() {
        let item = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            INSERT INTO line_items (
                line_item_id, document_id, tenant_id, description, quantity, unit,
                unit_price, discount_pct, vat_rate,
                total_excl_tax, total_tax, total_incl_tax, sort_order
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {LINE_ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(document.document_id)
        .bind(document.tenant_id)
        .bind(&line.description)
        .bind(calculator::round_quantity(line.quantity))
        .bind(&line.unit)
        .bind(calculator::round_quantity(line.unit_price))
        .bind(line.discount_pct)
        .bind(line.vat_rate)
        .bind(amounts.total_excl_tax)
        .bind(amounts.total_tax)
        .bind(amounts.total_incl_tax)
        .bind(index as i32)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_db_err("Failed to insert line item", e))?;
        items.push(item);
    }
    Ok(items)
}

/// What kind of snapshot copy is being inserted.
enum CopyKind {
    Duplicate,
    Rectificative,
    RectificativeValidated,
}

/// Insert a new document copied from a source snapshot. Duplicates stay
/// unlinked; rectificatives carry `rectifies_document_id`.
async fn insert_document_copy(
    tx: &mut Transaction<'_, Postgres>,
    source: &Document,
    document_number: &str,
    kind: CopyKind,
) -> Result<Document, AppError> {
    let (rectifies, lifecycle_state) = match kind {
        CopyKind::Duplicate => (None, LifecycleState::Draft),
        CopyKind::Rectificative => (Some(source.document_id), LifecycleState::Draft),
        CopyKind::RectificativeValidated => (Some(source.document_id), LifecycleState::Validated),
    };

    sqlx::query_as::<_, Document>(&format!(
        r#"
        INSERT INTO documents (
            document_id, tenant_id, document_number, document_type, invoice_kind,
            fiscal_year, client_id, client_name, currency, exchange_rate,
            total_excl_tax, total_tax, stamp_duty, total_incl_tax,
            lifecycle_state, payment_state, rectifies_document_id,
            authorization_number, authorization_valid_until, purchase_order_ref,
            notes, issue_date, validated_utc
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                $15, 'unpaid', $16, $17, $18, $19, $20, $21,
                CASE WHEN $15 = 'validated'::lifecycle_state THEN NOW() ELSE NULL END)
        RETURNING {DOCUMENT_COLUMNS}
        "#
    ))
    .bind(Uuid::new_v4())
    .bind(source.tenant_id)
    .bind(document_number)
    .bind(source.document_type)
    .bind(source.invoice_kind)
    .bind(source.fiscal_year)
    .bind(source.client_id)
    .bind(&source.client_name)
    .bind(&source.currency)
    .bind(source.exchange_rate)
    .bind(source.total_excl_tax)
    .bind(source.total_tax)
    .bind(source.stamp_duty)
    .bind(source.total_incl_tax)
    .bind(lifecycle_state)
    .bind(rectifies)
    .bind(&source.authorization_number)
    .bind(source.authorization_valid_until)
    .bind(&source.purchase_order_ref)
    .bind(&source.notes)
    .bind(Utc::now().date_naive())
    .fetch_one(&mut **tx)
    .await
    .map_err(|e| map_db_err("Failed to insert document copy", e))
}

/// Copy stored line items verbatim onto a new document.
async fn copy_line_items(
    tx: &mut Transaction<'_, Postgres>,
    document: &Document,
    source_lines: &[LineItem],
) -> Result<Vec<LineItem>, AppError> {
    let mut items = Vec::with_capacity(source_lines.len());
    for line in source_lines {
        let item = sqlx::query_as::<_, LineItem>(&format!(
            r#"
            INSERT INTO line_items (
                line_item_id, document_id, tenant_id, description, quantity, unit,
                unit_price, discount_pct, vat_rate,
                total_excl_tax, total_tax, total_incl_tax, sort_order
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            RETURNING {LINE_ITEM_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(document.document_id)
        .bind(document.tenant_id)
        .bind(&line.description)
        .bind(line.quantity)
        .bind(&line.unit)
        .bind(line.unit_price)
        .bind(line.discount_pct)
        .bind(line.vat_rate)
        .bind(line.total_excl_tax)
        .bind(line.total_tax)
        .bind(line.total_incl_tax)
        .bind(line.sort_order)
        .fetch_one(&mut **tx)
        .await
        .map_err(|e| map_db_err("Failed to copy line item", e))?;
        items.push(item);
    }
    Ok(items)
}

// -------------------------------------------------------------------------
// Input validation
// -------------------------------------------------------------------------

fn validate_fiscal_year(fiscal_year: i32) -> Result<(), AppError> {
    if !(2000..=2099).contains(&fiscal_year) {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "Fiscal year {} out of range",
            fiscal_year
        )));
    }
    Ok(())
}

fn validate_lines(lines: &[LineItemInput]) -> Result<(), AppError> {
    if lines.is_empty() {
        return Err(AppError::BadRequest(anyhow::anyhow!(
            "A document requires at least one line item"
        )));
    }

    for (index, line) in lines.iter().enumerate() {
        if line.description.trim().is_empty() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "line {}: description is required",
                index + 1
            )));
        }
        if line.quantity <= Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "line {}: quantity must be positive",
                index + 1
            )));
        }
        if line.unit_price < Decimal::ZERO {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "line {}: unit price cannot be negative",
                index + 1
            )));
        }
        if line.discount_pct < Decimal::ZERO || line.discount_pct > Decimal::ONE_HUNDRED {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "line {}: discount must be between 0 and 100",
                index + 1
            )));
        }
        if line.vat_rate < Decimal::ZERO || line.vat_rate > Decimal::ONE_HUNDRED {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "line {}: VAT rate must be between 0 and 100",
                index + 1
            )));
        }
    }
    Ok(())
}

/// The suspension authorization trio is required together on VAT-suspended
/// documents and rejected on every other kind.
fn validate_suspension_fields(
    kind: InvoiceKind,
    authorization_number: Option<&str>,
    has_valid_until: bool,
    purchase_order_ref: Option<&str>,
) -> Result<(), AppError> {
    let has_number = authorization_number.is_some_and(|s| !s.trim().is_empty());
    let has_po = purchase_order_ref.is_some_and(|s| !s.trim().is_empty());

    match kind {
        InvoiceKind::VatSuspended => {
            if !(has_number && has_valid_until && has_po) {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "VAT-suspended invoices require the authorization number, \
                     its validity date and the purchase order reference"
                )));
            }
        }
        InvoiceKind::Local | InvoiceKind::Export => {
            if has_number || has_valid_until || has_po {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "Suspension fields only apply to VAT-suspended invoices"
                )));
            }
        }
    }
    Ok(())
}

fn validate_exchange_rate(currency: &str, exchange_rate: Option<Decimal>) -> Result<(), AppError> {
    if currency == HOME_CURRENCY {
        if exchange_rate.is_some() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Exchange rate only applies to foreign-currency documents"
            )));
        }
        return Ok(());
    }

    match exchange_rate {
        Some(rate) if rate > Decimal::ZERO => Ok(()),
        Some(rate) => Err(AppError::BadRequest(anyhow::anyhow!(
            "Exchange rate must be positive, got {}",
            rate
        ))),
        None => Err(AppError::BadRequest(anyhow::anyhow!(
            "Exchange rate is required for {} documents",
            currency
        ))),
    }
}

fn decimal_to_f64(amount: Decimal) -> f64 {
    use rust_decimal::prelude::ToPrimitive;
    amount.to_f64().unwrap_or(0.0)
}
