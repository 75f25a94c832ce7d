//! Integration tests for keyed replay protection.

mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};
use common::spawn_app;
use reconciliation_service::services::idempotency::{
    GuardedResponse, IdempotencyGuard, IdempotentRequest, IdempotentResponse,
};
use reconciliation_service::services::ranking::RankingOptions;
use reconciliation_service::services::store::Store;
use reconciliation_service::services::ReconciliationEngine;
use serde_json::{json, Value};
use service_core::error::AppError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

async fn run_keyed(
    guard: &IdempotencyGuard,
    engine: &ReconciliationEngine,
    tenant_id: Uuid,
    key: Option<&str>,
    payload: &Value,
) -> Result<GuardedResponse, AppError> {
    let engine = engine.clone();
    guard
        .execute(
            IdempotentRequest {
                key,
                tenant_id,
                operation: "reconcile",
                payload,
            },
            move |uow| {
                Box::pin(async move {
                    let result = engine
                        .run_reconciliation_in(uow, tenant_id, RankingOptions::default())
                        .await?;
                    IdempotentResponse::json(StatusCode::OK, &result)
                })
            },
        )
        .await
}

#[tokio::test]
async fn same_key_and_payload_replays_without_side_effects() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let payload = json!({"top": 5, "min_score": "60"});

    let first = run_keyed(
        &app.state.guard,
        &app.state.engine,
        app.tenant_id,
        Some("run-1"),
        &payload,
    )
    .await
    .unwrap();
    assert!(!first.replayed);
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);

    let second = run_keyed(
        &app.state.guard,
        &app.state.engine,
        app.tenant_id,
        Some("run-1"),
        &payload,
    )
    .await
    .unwrap();
    assert!(second.replayed);
    assert_eq!(second.status, first.status);
    assert_eq!(second.body, first.body);
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);
}

#[tokio::test]
async fn same_key_different_payload_conflicts() {
    let app = spawn_app();
    app.seed_competing_pair().await;

    run_keyed(
        &app.state.guard,
        &app.state.engine,
        app.tenant_id,
        Some("run-2"),
        &json!({"top": 5}),
    )
    .await
    .unwrap();

    let err = run_keyed(
        &app.state.guard,
        &app.state.engine,
        app.tenant_id,
        Some("run-2"),
        &json!({"top": 1}),
    )
    .await
    .unwrap_err();
    match err {
        AppError::Conflict(e) => {
            let message = e.to_string();
            assert!(message.contains("different request payload"));
            assert!(!message.contains("top"));
        }
        other => panic!("expected conflict, got {:?}", other),
    }
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);
}

#[tokio::test]
async fn key_is_scoped_by_tenant_and_operation() {
    let app = spawn_app();
    let payload = json!({});
    let calls = Arc::new(AtomicUsize::new(0));

    for (tenant_id, operation) in [
        (app.tenant_id, "reconcile"),
        (Uuid::new_v4(), "reconcile"),
        (app.tenant_id, "confirm_match"),
    ] {
        let calls = calls.clone();
        app.state
            .guard
            .execute(
                IdempotentRequest {
                    key: Some("shared"),
                    tenant_id,
                    operation,
                    payload: &payload,
                },
                move |_uow| {
                    Box::pin(async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(IdempotentResponse {
                            status: StatusCode::OK,
                            body: "{}".to_string(),
                        })
                    })
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn concurrent_first_attempts_execute_once() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let payload = json!({"top": 5});

    let (a, b) = tokio::join!(
        run_keyed(
            &app.state.guard,
            &app.state.engine,
            app.tenant_id,
            Some("race"),
            &payload
        ),
        run_keyed(
            &app.state.guard,
            &app.state.engine,
            app.tenant_id,
            Some("race"),
            &payload
        ),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.body, b.body);
    assert!(a.replayed ^ b.replayed);
    assert_eq!(app.store.match_count(app.tenant_id).await, 2);
}

#[tokio::test]
async fn failed_operation_records_nothing() {
    let app = spawn_app();
    let payload = json!({"match_id": Uuid::nil()});

    let err = app
        .state
        .guard
        .execute(
            IdempotentRequest {
                key: Some("fails"),
                tenant_id: app.tenant_id,
                operation: "confirm_match",
                payload: &payload,
            },
            |_uow| {
                Box::pin(async move {
                    Err(AppError::DatabaseError(anyhow::anyhow!("connection reset")))
                })
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(app.store.idempotency_record_count().await, 0);

    // The retry runs for real.
    let retried = app
        .state
        .guard
        .execute(
            IdempotentRequest {
                key: Some("fails"),
                tenant_id: app.tenant_id,
                operation: "confirm_match",
                payload: &payload,
            },
            |_uow| {
                Box::pin(async move {
                    Ok(IdempotentResponse {
                        status: StatusCode::OK,
                        body: r#"{"ok":true}"#.to_string(),
                    })
                })
            },
        )
        .await
        .unwrap();
    assert!(!retried.replayed);
    assert_eq!(app.store.idempotency_record_count().await, 1);
}

#[tokio::test]
async fn expired_key_executes_again_and_is_purged() {
    let app = spawn_app();
    app.seed_competing_pair().await;
    let store: Arc<dyn Store> = Arc::new(app.store.clone());
    let short_lived = IdempotencyGuard::new(store, Duration::milliseconds(-1));
    let payload = json!({"top": 5});

    let first = run_keyed(
        &short_lived,
        &app.state.engine,
        app.tenant_id,
        Some("stale"),
        &payload,
    )
    .await
    .unwrap();
    let second = run_keyed(
        &short_lived,
        &app.state.engine,
        app.tenant_id,
        Some("stale"),
        &payload,
    )
    .await
    .unwrap();

    assert!(!first.replayed);
    assert!(!second.replayed);
    assert_eq!(app.store.match_count(app.tenant_id).await, 4);

    let removed = short_lived.purge_expired(Utc::now()).await.unwrap();
    assert_eq!(removed, 1);
    assert_eq!(app.store.idempotency_record_count().await, 0);
}

#[tokio::test]
async fn invalid_key_is_rejected_before_running() {
    let app = spawn_app();
    let long_key = "k".repeat(300);

    let result = run_keyed(
        &app.state.guard,
        &app.state.engine,
        app.tenant_id,
        Some(&long_key),
        &json!({}),
    )
    .await;
    assert!(matches!(result, Err(AppError::ValidationError(_))));
    assert_eq!(app.store.idempotency_record_count().await, 0);
}
