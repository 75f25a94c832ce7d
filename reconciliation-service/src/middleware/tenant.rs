//! Request context extractors.
//!
//! The tenant is taken from `X-Tenant-ID`, which the authenticating gateway
//! sets. A tenant id in a request body is never consulted.

use crate::services::idempotency::IDEMPOTENCY_KEY_HEADER;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use service_core::error::AppError;
use uuid::Uuid;

pub const TENANT_ID_HEADER: &str = "x-tenant-id";

/// Tenant identifier of the authenticated caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let raw = parts
            .headers
            .get(TENANT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Unauthorized(anyhow::anyhow!("Missing X-Tenant-ID header")))?;

        let tenant_id = Uuid::parse_str(raw.trim()).map_err(|_| {
            AppError::Unauthorized(anyhow::anyhow!("X-Tenant-ID must be a UUID"))
        })?;

        Ok(TenantId(tenant_id))
    }
}

/// Optional client-supplied `Idempotency-Key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey(pub Option<String>);

#[async_trait]
impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.headers.get(IDEMPOTENCY_KEY_HEADER) {
            None => Ok(IdempotencyKey(None)),
            Some(value) => {
                let key = value.to_str().map_err(|_| {
                    AppError::BadRequest(anyhow::anyhow!(
                        "Idempotency-Key must be visible ASCII"
                    ))
                })?;
                Ok(IdempotencyKey(Some(key.to_string())))
            }
        }
    }
}
