//! Rectificative invoice integration tests.

mod common;

use common::{dec, line, TestApp, FISCAL_YEAR};
use rust_decimal_macros::dec as d;
use serde_json::json;

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn rectifying_a_validated_invoice_opens_an_editable_snapshot() {
    let app = TestApp::spawn().await;

    let source = app.create_validated(json!([line("2", "50.00", "19")])).await;
    let source_id = source["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/rectify", app.document_url(source_id)))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.unwrap();
    let rectificative = &body["document"];

    // An independent draft with its own invoice-family number, not a negation.
    assert_eq!(rectificative["document_type"], "invoice");
    assert_eq!(rectificative["lifecycle_state"], "draft");
    assert_eq!(
        rectificative["rectifies_document_id"],
        source["document"]["document_id"]
    );
    assert!(rectificative["document_number"]
        .as_str()
        .unwrap()
        .starts_with(&format!("FAC-{}-", FISCAL_YEAR)));
    assert_eq!(dec(&rectificative["total_incl_tax"]), d!(120.00));

    // Fully re-editable through the normal lifecycle path.
    let rectificative_id = rectificative["document_id"].as_str().unwrap();
    let response = app
        .client
        .put(app.document_url(rectificative_id))
        .json(&json!({
            "client_id": app.client_id,
            "lines": [line("2", "45.00", "19")],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let edited: serde_json::Value = response.json().await.unwrap();
    assert_eq!(dec(&edited["document"]["total_excl_tax"]), d!(90.00));

    // The source invoice was read-only input.
    let source_after: serde_json::Value = app
        .client
        .get(app.document_url(source_id))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(source_after["document"]["lifecycle_state"], "validated");
    assert_eq!(dec(&source_after["document"]["total_incl_tax"]), d!(120.00));
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn rectificative_can_be_created_directly_validated() {
    let app = TestApp::spawn().await;

    let source = app.create_validated(json!([line("1", "10.00", "0")])).await;
    let source_id = source["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/rectify", app.document_url(source_id)))
        .json(&json!({ "validate_immediately": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["document"]["lifecycle_state"], "validated");
    assert!(!body["document"]["validated_utc"].is_null());
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn drafts_cannot_be_rectified() {
    let app = TestApp::spawn().await;

    let draft = app.create_draft(json!([line("1", "10.00", "0")])).await;
    let draft_id = draft["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/rectify", app.document_url(draft_id)))
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}
