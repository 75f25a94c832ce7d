//! Integration tests for the REST surface.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use common::{spawn_app, TestApp};
use http_body_util::BodyExt;
use reconciliation_service::router;
use serde_json::{json, Value};
use tower::ServiceExt;

fn app_router(app: &TestApp) -> Router {
    router(app.state.clone())
}

fn post(uri: &str, tenant: &str, key: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("x-tenant-id", tenant);
    if let Some(key) = key {
        builder = builder.header("idempotency-key", key);
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn get(uri: &str, tenant: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-tenant-id", tenant)
        .body(Body::empty())
        .unwrap()
}

async fn body_bytes(response: axum::response::Response) -> Vec<u8> {
    response
        .into_body()
        .collect()
        .await
        .unwrap()
        .to_bytes()
        .to_vec()
}

#[tokio::test]
async fn missing_or_malformed_tenant_is_unauthorized() {
    let app = spawn_app();

    let response = app_router(&app)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/reconcile")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app_router(&app)
        .oneshot(post("/api/v1/reconcile", "not-a-uuid", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn reconcile_replays_with_identical_body() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let tenant = app.tenant_id.to_string();

    let first = app_router(&app)
        .oneshot(post("/api/v1/reconcile?top=5", &tenant, Some("key-1"), None))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert!(first.headers().get("idempotent-replayed").is_none());
    let first_body = body_bytes(first).await;

    let second = app_router(&app)
        .oneshot(post("/api/v1/reconcile?top=5", &tenant, Some("key-1"), None))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("idempotent-replayed").unwrap(), "true");
    assert_eq!(body_bytes(second).await, first_body);

    let parsed: Value = serde_json::from_slice(&first_body).unwrap();
    assert_eq!(parsed["total"], 2);
    assert_eq!(parsed["returned"], 2);
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);

    let conflict = app_router(&app)
        .oneshot(post("/api/v1/reconcile?top=1", &tenant, Some("key-1"), None))
        .await
        .unwrap();
    assert_eq!(conflict.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn negative_top_is_unprocessable() {
    let app = spawn_app();
    let response = app_router(&app)
        .oneshot(post(
            "/api/v1/reconcile?top=-1",
            &app.tenant_id.to_string(),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn malformed_query_is_unprocessable_json() {
    let app = spawn_app();
    let tenant = app.tenant_id.to_string();

    for uri in ["/api/v1/reconcile?min_score=abc", "/api/v1/reconcile?top=many"] {
        let response = app_router(&app)
            .oneshot(post(uri, &tenant, None, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{}", uri);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
        let body: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
        assert_eq!(body["error"], "Validation error");
        assert!(body["details"].as_str().unwrap().contains("query"));
    }
    assert_eq!(app.store.match_count(app.tenant_id).await, 0);
}

#[tokio::test]
async fn equivalent_thresholds_replay_under_one_key() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let tenant = app.tenant_id.to_string();

    let first = app_router(&app)
        .oneshot(post(
            "/api/v1/reconcile?min_score=60",
            &tenant,
            Some("threshold-key"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let first_body = body_bytes(first).await;

    let second = app_router(&app)
        .oneshot(post(
            "/api/v1/reconcile?min_score=60.00",
            &tenant,
            Some("threshold-key"),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get("idempotent-replayed").unwrap(), "true");
    assert_eq!(body_bytes(second).await, first_body);
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);
}

#[tokio::test]
async fn confirm_and_list_matches() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let tenant = app.tenant_id.to_string();

    let run = app_router(&app)
        .oneshot(post("/api/v1/reconcile", &tenant, None, None))
        .await
        .unwrap();
    let run: Value = serde_json::from_slice(&body_bytes(run).await).unwrap();
    let match_id = run["candidates"][0]["match_id"].as_str().unwrap().to_string();

    let confirm_uri = format!("/api/v1/matches/{}/confirm", match_id);
    let confirmed = app_router(&app)
        .oneshot(post(&confirm_uri, &tenant, Some("confirm-1"), None))
        .await
        .unwrap();
    assert_eq!(confirmed.status(), StatusCode::OK);
    let confirmed: Value = serde_json::from_slice(&body_bytes(confirmed).await).unwrap();
    assert_eq!(confirmed["status"], "confirmed");

    let rejected = app_router(&app)
        .oneshot(get("/api/v1/matches?status=rejected", &tenant))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::OK);
    let rejected: Value = serde_json::from_slice(&body_bytes(rejected).await).unwrap();
    assert_eq!(rejected.as_array().unwrap().len(), 1);

    let bad_status = app_router(&app)
        .oneshot(get("/api/v1/matches?status=pending", &tenant))
        .await
        .unwrap();
    assert_eq!(bad_status.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Same key, different match id in the path.
    let other_uri = format!("/api/v1/matches/{}/confirm", uuid::Uuid::new_v4());
    let reused = app_router(&app)
        .oneshot(post(&other_uri, &tenant, Some("confirm-1"), None))
        .await
        .unwrap();
    assert_eq!(reused.status(), StatusCode::CONFLICT);

    let missing = app_router(&app)
        .oneshot(post(&other_uri, &tenant, None, None))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn explain_without_provider_is_heuristic() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let tenant = app.tenant_id.to_string();

    let run = app_router(&app)
        .oneshot(post("/api/v1/reconcile", &tenant, None, None))
        .await
        .unwrap();
    let run: Value = serde_json::from_slice(&body_bytes(run).await).unwrap();
    let candidate = &run["candidates"][0];

    let response = app_router(&app)
        .oneshot(get(
            &format!(
                "/api/v1/matches/{}/explain",
                candidate["match_id"].as_str().unwrap()
            ),
            &tenant,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let explanation: Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(explanation["source"], "heuristic");
    assert_eq!(explanation["heuristic_reason"], candidate["reason"]);
    assert!(explanation["ai_explanation"].is_null());
}

#[tokio::test]
async fn import_endpoints_create_and_replay() {
    let app = spawn_app();
    let tenant = app.tenant_id.to_string();
    let body = json!({
        "transactions": [{
            "external_id": "BANK-77",
            "posted_utc": "2026-01-02T09:30:00Z",
            "amount": "120.00",
            "currency": "EUR",
            "description": "Globex payment"
        }]
    });

    let created = app_router(&app)
        .oneshot(post(
            "/api/v1/bank-transactions/import",
            &tenant,
            Some("import-1"),
            Some(body.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(created.status(), StatusCode::CREATED);
    let created_body = body_bytes(created).await;

    let replayed = app_router(&app)
        .oneshot(post(
            "/api/v1/bank-transactions/import",
            &tenant,
            Some("import-1"),
            Some(body.clone()),
        ))
        .await
        .unwrap();
    assert_eq!(replayed.status(), StatusCode::CREATED);
    assert_eq!(body_bytes(replayed).await, created_body);

    let duplicate = app_router(&app)
        .oneshot(post(
            "/api/v1/bank-transactions/import",
            &tenant,
            None,
            Some(body),
        ))
        .await
        .unwrap();
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let invoices = app_router(&app)
        .oneshot(post(
            "/api/v1/invoices/import",
            &tenant,
            None,
            Some(json!({
                "invoices": [{
                    "invoice_number": "G-1",
                    "vendor_name": "Globex",
                    "amount": "120.00",
                    "currency": "EUR",
                    "invoice_date": "2026-01-01"
                }]
            })),
        ))
        .await
        .unwrap();
    assert_eq!(invoices.status(), StatusCode::CREATED);
    let invoices: Value = serde_json::from_slice(&body_bytes(invoices).await).unwrap();
    assert_eq!(invoices["imported_count"], 1);

    let invalid = app_router(&app)
        .oneshot(post(
            "/api/v1/invoices/import",
            &tenant,
            None,
            Some(json!({"invoices": []})),
        ))
        .await
        .unwrap();
    assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn probes_respond() {
    let app = spawn_app();

    let health = app_router(&app)
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));

    let ready = app_router(&app)
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(ready.status(), StatusCode::OK);
}
