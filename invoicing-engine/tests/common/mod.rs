//! Common test utilities for invoicing-engine integration tests.
//!
//! Each test spawns the service against the database named by
//! `TEST_DATABASE_URL` (falling back to `DATABASE_URL`) and works inside a
//! fresh random tenant, so suites are isolated without cleanup.

use std::sync::Arc;

use invoicing_engine::services::Database;
use invoicing_engine::startup::build_router;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use uuid::Uuid;

/// Fiscal year used by the suites; an open exercise is seeded for it.
pub const FISCAL_YEAR: i32 = 2026;

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub db: Arc<Database>,
    pub tenant_id: Uuid,
    pub client_id: Uuid,
}

impl TestApp {
    /// Spawn the service on an ephemeral port with a seeded tenant: one
    /// TND-preference client and an open fiscal exercise.
    pub async fn spawn() -> Self {
        let database_url = std::env::var("TEST_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .expect("TEST_DATABASE_URL or DATABASE_URL must be set");

        let db = Database::new(&database_url, 8, 1)
            .await
            .expect("Failed to connect to test database");
        db.run_migrations()
            .await
            .expect("Failed to run migrations");

        let tenant_id = Uuid::new_v4();
        let client_id = seed_client(&db, tenant_id, "Société Test", "TND").await;
        seed_exercise(&db, tenant_id, FISCAL_YEAR, true).await;

        let db = Arc::new(db);
        let app = build_router(db.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let address = format!("http://{}", listener.local_addr().unwrap());

        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("Test server died");
        });

        TestApp {
            address,
            client: reqwest::Client::new(),
            db,
            tenant_id,
            client_id,
        }
    }

    pub fn documents_url(&self) -> String {
        format!("{}/tenants/{}/documents", self.address, self.tenant_id)
    }

    pub fn document_url(&self, document_id: &str) -> String {
        format!("{}/{}", self.documents_url(), document_id)
    }

    /// Create a draft LOCAL/TND invoice with the given lines.
    pub async fn create_draft(&self, lines: Value) -> Value {
        let response = self
            .client
            .post(self.documents_url())
            .json(&json!({
                "client_id": self.client_id,
                "fiscal_year": FISCAL_YEAR,
                "lines": lines,
            }))
            .send()
            .await
            .expect("Failed to create draft");
        assert_eq!(response.status(), 201, "draft creation should succeed");
        response.json().await.expect("Invalid draft response")
    }

    /// Create a LOCAL/TND invoice directly in the validated state.
    pub async fn create_validated(&self, lines: Value) -> Value {
        let response = self
            .client
            .post(self.documents_url())
            .json(&json!({
                "client_id": self.client_id,
                "fiscal_year": FISCAL_YEAR,
                "validate_immediately": true,
                "lines": lines,
            }))
            .send()
            .await
            .expect("Failed to create validated invoice");
        assert_eq!(response.status(), 201, "creation should succeed");
        response.json().await.expect("Invalid response")
    }
}

/// Insert a client directory row.
pub async fn seed_client(db: &Database, tenant_id: Uuid, name: &str, currency: &str) -> Uuid {
    let client_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO clients (client_id, tenant_id, name, tax_id, currency) \
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(client_id)
    .bind(tenant_id)
    .bind(name)
    .bind("1234567/A/M/000")
    .bind(currency)
    .execute(db.pool())
    .await
    .expect("Failed to seed client");
    client_id
}

/// Insert a fiscal exercise row.
pub async fn seed_exercise(db: &Database, tenant_id: Uuid, fiscal_year: i32, is_open: bool) {
    sqlx::query(
        "INSERT INTO fiscal_exercises (tenant_id, fiscal_year, is_open) \
         VALUES ($1, $2, $3) ON CONFLICT (tenant_id, fiscal_year) DO UPDATE SET is_open = $3",
    )
    .bind(tenant_id)
    .bind(fiscal_year)
    .bind(is_open)
    .execute(db.pool())
    .await
    .expect("Failed to seed fiscal exercise");
}

/// A single LOCAL line: qty x price at the given VAT rate.
pub fn line(quantity: &str, unit_price: &str, vat_rate: &str) -> Value {
    json!({
        "description": "Prestation de service",
        "quantity": quantity,
        "unit_price": unit_price,
        "vat_rate": vat_rate,
    })
}

/// Parse a decimal field out of a JSON response.
pub fn dec(value: &Value) -> Decimal {
    let s = value
        .as_str()
        .unwrap_or_else(|| panic!("expected decimal string, got {}", value));
    s.parse().expect("invalid decimal")
}
