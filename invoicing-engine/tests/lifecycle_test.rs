//! Lifecycle integration tests: validate, edit, delete, duplicate.

mod common;

use common::{dec, line, seed_exercise, TestApp, FISCAL_YEAR};
use rust_decimal_macros::dec as d;
use serde_json::json;

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn validate_draft_stamps_validated_utc() {
    let app = TestApp::spawn().await;

    let created = app.create_draft(json!([line("2", "50.00", "19")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();
    assert!(created["document"]["validated_utc"].is_null());

    let response = app
        .client
        .post(format!("{}/validate", app.document_url(document_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["document"]["lifecycle_state"], "validated");
    assert!(!body["document"]["validated_utc"].is_null());

    // Irreversible: a second validation conflicts.
    let response = app
        .client
        .post(format!("{}/validate", app.document_url(document_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn validation_requires_an_open_exercise() {
    let app = TestApp::spawn().await;
    seed_exercise(&app.db, app.tenant_id, FISCAL_YEAR, false).await;

    let created = app.create_draft(json!([line("1", "10.00", "0")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/validate", app.document_url(document_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "exercise_closed");
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn edit_draft_replaces_lines_and_recomputes_totals() {
    let app = TestApp::spawn().await;

    let created = app.create_draft(json!([line("2", "50.00", "19")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();
    let number = created["document"]["document_number"].clone();

    let response = app
        .client
        .put(app.document_url(document_id))
        .json(&json!({
            "client_id": app.client_id,
            "lines": [line("1", "200.00", "7"), line("4", "25.00", "19")],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    let document = &body["document"];

    // The number never changes once assigned.
    assert_eq!(document["document_number"], number);

    // 200.00 @ 7% + 100.00 @ 19% => 300.00 excl, 33.00 tax, 1.00 stamp.
    assert_eq!(dec(&document["total_excl_tax"]), d!(300.00));
    assert_eq!(dec(&document["total_tax"]), d!(33.00));
    assert_eq!(dec(&document["total_incl_tax"]), d!(334.00));
    assert_eq!(body["line_items"].as_array().unwrap().len(), 2);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn validated_document_cannot_be_edited() {
    let app = TestApp::spawn().await;

    let created = app.create_validated(json!([line("1", "10.00", "0")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .put(app.document_url(document_id))
        .json(&json!({
            "client_id": app.client_id,
            "lines": [line("1", "999.00", "0")],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn delete_draft_removes_document_and_lines() {
    let app = TestApp::spawn().await;

    let created = app.create_draft(json!([line("1", "10.00", "0")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .delete(app.document_url(document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let response = app
        .client
        .get(app.document_url(document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn delete_validated_conflicts_and_leaves_document_unchanged() {
    let app = TestApp::spawn().await;

    let created = app.create_validated(json!([line("2", "50.00", "19")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .delete(app.document_url(document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);

    // Document and items survive untouched.
    let response = app
        .client
        .get(app.document_url(document_id))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(dec(&body["document"]["total_incl_tax"]), d!(120.00));
    assert_eq!(body["line_items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn duplicate_draft_allocates_a_fresh_number() {
    let app = TestApp::spawn().await;

    let created = app.create_draft(json!([line("2", "50.00", "19")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/duplicate", app.document_url(document_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 201);

    let body: serde_json::Value = response.json().await.unwrap();
    let duplicate = &body["document"];

    assert_ne!(duplicate["document_id"], created["document"]["document_id"]);
    assert_ne!(
        duplicate["document_number"],
        created["document"]["document_number"]
    );
    assert_eq!(duplicate["lifecycle_state"], "draft");
    assert_eq!(
        dec(&duplicate["total_incl_tax"]),
        dec(&created["document"]["total_incl_tax"])
    );
    assert_eq!(body["line_items"].as_array().unwrap().len(), 1);
}

#[tokio::test]
#[ignore = "requires a running PostgreSQL (set TEST_DATABASE_URL)"]
async fn duplicate_validated_conflicts() {
    let app = TestApp::spawn().await;

    let created = app.create_validated(json!([line("1", "10.00", "0")])).await;
    let document_id = created["document"]["document_id"].as_str().unwrap();

    let response = app
        .client
        .post(format!("{}/duplicate", app.document_url(document_id)))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 409);
}
