use crate::dtos::{ImportInvoicesRequest, ImportTransactionsRequest};
use crate::middleware::{IdempotencyKey, TenantId};
use crate::services::idempotency::{GuardedResponse, IdempotentRequest, IdempotentResponse};
use crate::startup::AppState;
use axum::{extract::State, http::StatusCode, Json};
use service_core::error::AppError;
use validator::Validate;

pub const IMPORT_TRANSACTIONS_OPERATION: &str = "import_transactions";
pub const IMPORT_INVOICES_OPERATION: &str = "import_invoices";

fn payload_of<T: serde::Serialize>(request: &T) -> Result<serde_json::Value, AppError> {
    serde_json::to_value(request).map_err(|e| {
        AppError::InternalError(anyhow::anyhow!("Failed to encode request payload: {}", e))
    })
}

/// POST /api/v1/bank-transactions/import
pub async fn import_transactions(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    IdempotencyKey(key): IdempotencyKey,
    Json(request): Json<ImportTransactionsRequest>,
) -> Result<GuardedResponse, AppError> {
    request.validate()?;

    tracing::info!(
        tenant_id = %tenant_id,
        count = request.transactions.len(),
        "Importing bank transactions"
    );

    let payload = payload_of(&request)?;
    let engine = state.engine.clone();

    state
        .guard
        .execute(
            IdempotentRequest {
                key: key.as_deref(),
                tenant_id,
                operation: IMPORT_TRANSACTIONS_OPERATION,
                payload: &payload,
            },
            move |uow| {
                Box::pin(async move {
                    let imported = engine
                        .import_transactions_in(uow, tenant_id, request.transactions)
                        .await?;
                    IdempotentResponse::json(StatusCode::CREATED, &imported)
                })
            },
        )
        .await
}

/// POST /api/v1/invoices/import
pub async fn import_invoices(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    IdempotencyKey(key): IdempotencyKey,
    Json(request): Json<ImportInvoicesRequest>,
) -> Result<GuardedResponse, AppError> {
    request.validate()?;

    tracing::info!(
        tenant_id = %tenant_id,
        count = request.invoices.len(),
        "Importing invoices"
    );

    let payload = payload_of(&request)?;
    let engine = state.engine.clone();

    state
        .guard
        .execute(
            IdempotentRequest {
                key: key.as_deref(),
                tenant_id,
                operation: IMPORT_INVOICES_OPERATION,
                payload: &payload,
            },
            move |uow| {
                Box::pin(async move {
                    let imported = engine
                        .import_invoices_in(uow, tenant_id, request.invoices)
                        .await?;
                    IdempotentResponse::json(StatusCode::CREATED, &imported)
                })
            },
        )
        .await
}
