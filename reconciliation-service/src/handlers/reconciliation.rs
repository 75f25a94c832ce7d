//! Reconciliation run, match listing, confirmation and explanation.

use crate::dtos::{ListMatchesQuery, ReconcileQuery};
use crate::middleware::{IdempotencyKey, TenantId};
use crate::models::{Match, MatchStatus};
use crate::services::explanation::Explanation;
use crate::services::idempotency::{GuardedResponse, IdempotentRequest, IdempotentResponse};
use crate::startup::AppState;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    Json,
};
use serde_json::json;
use service_core::error::AppError;
use uuid::Uuid;

pub const RECONCILE_OPERATION: &str = "reconcile";
pub const CONFIRM_MATCH_OPERATION: &str = "confirm_match";

/// POST /api/v1/reconcile
pub async fn reconcile(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    IdempotencyKey(key): IdempotencyKey,
    query: Result<Query<ReconcileQuery>, QueryRejection>,
) -> Result<GuardedResponse, AppError> {
    let Query(query) = query.map_err(|e| {
        AppError::invalid_field("query", "format", e.body_text())
    })?;
    let options = state.engine.ranking_options(query.top, query.min_score)?;

    tracing::info!(
        tenant_id = %tenant_id,
        top = options.top,
        min_score = %options.min_score,
        "Running reconciliation"
    );

    let payload = json!({ "top": options.top, "min_score": options.min_score.normalize() });
    let engine = state.engine.clone();

    state
        .guard
        .execute(
            IdempotentRequest {
                key: key.as_deref(),
                tenant_id,
                operation: RECONCILE_OPERATION,
                payload: &payload,
            },
            move |uow| {
                Box::pin(async move {
                    let result = engine
                        .run_reconciliation_in(uow, tenant_id, options)
                        .await?;
                    IdempotentResponse::json(StatusCode::OK, &result)
                })
            },
        )
        .await
}

/// GET /api/v1/matches
pub async fn list_matches(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    query: Result<Query<ListMatchesQuery>, QueryRejection>,
) -> Result<Json<Vec<Match>>, AppError> {
    let Query(query) = query.map_err(|e| {
        AppError::invalid_field("query", "format", e.body_text())
    })?;
    let status = query
        .status
        .as_deref()
        .map(MatchStatus::parse)
        .transpose()
        .map_err(|e| AppError::invalid_field("status", "enum", e.to_string()))?;

    let matches = state.engine.list_matches(tenant_id, status).await?;
    Ok(Json(matches))
}

/// POST /api/v1/matches/:match_id/confirm
pub async fn confirm_match(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    IdempotencyKey(key): IdempotencyKey,
    Path(match_id): Path<Uuid>,
) -> Result<GuardedResponse, AppError> {
    tracing::info!(tenant_id = %tenant_id, match_id = %match_id, "Confirming match");

    let payload = json!({ "match_id": match_id });
    let engine = state.engine.clone();

    state
        .guard
        .execute(
            IdempotentRequest {
                key: key.as_deref(),
                tenant_id,
                operation: CONFIRM_MATCH_OPERATION,
                payload: &payload,
            },
            move |uow| {
                Box::pin(async move {
                    let confirmed = engine.confirm_match_in(uow, tenant_id, match_id).await?;
                    IdempotentResponse::json(StatusCode::OK, &confirmed)
                })
            },
        )
        .await
}

/// GET /api/v1/matches/:match_id/explain
pub async fn explain_match(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(match_id): Path<Uuid>,
) -> Result<Json<Explanation>, AppError> {
    let explanation = state.engine.explain_match(tenant_id, match_id).await?;
    Ok(Json(explanation))
}
