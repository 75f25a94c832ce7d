//! Key-based replay protection for mutating operations.
//!
//! A keyed request claims its (key, tenant, operation) tuple inside the same
//! unit of work that performs the business writes, and the cached response is
//! attached before that unit commits. Either the business effect and its
//! record both persist, or neither does.

use crate::models::IdempotencyRecord;
use crate::services::metrics::{record_idempotency_cleanup, record_idempotency_outcome};
use crate::services::store::{Store, UnitOfWork};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use service_core::error::AppError;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";
pub const IDEMPOTENT_REPLAYED_HEADER: &str = "idempotent-replayed";

const MAX_KEY_LENGTH: usize = 255;
/// Attempts to claim a key whose holder keeps disappearing before we can read it.
const MAX_CLAIM_ATTEMPTS: u32 = 3;

/// Response of a mutating operation, in the form it is cached and replayed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotentResponse {
    pub status: StatusCode,
    pub body: String,
}

impl IdempotentResponse {
    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, AppError> {
        let body = serde_json::to_string(value).map_err(|e| {
            AppError::InternalError(anyhow::anyhow!("Failed to serialize response: {}", e))
        })?;
        Ok(Self { status, body })
    }
}

/// Outcome handed back to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardedResponse {
    pub status: StatusCode,
    pub body: String,
    /// True when the body came from a stored record instead of a fresh run.
    pub replayed: bool,
}

impl IntoResponse for GuardedResponse {
    fn into_response(self) -> Response {
        let mut response = (self.status, self.body).into_response();
        let headers = response.headers_mut();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        if self.replayed {
            headers.insert(
                IDEMPOTENT_REPLAYED_HEADER,
                HeaderValue::from_static("true"),
            );
        }
        response
    }
}

/// Identity of one guarded call.
#[derive(Debug, Clone, Copy)]
pub struct IdempotentRequest<'a> {
    pub key: Option<&'a str>,
    pub tenant_id: Uuid,
    pub operation: &'a str,
    pub payload: &'a Value,
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl IdempotencyGuard {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Runs `op` at most once per unexpired (key, tenant, operation) tuple.
    ///
    /// - No key: `op` runs in its own unit of work, nothing is recorded.
    /// - Unused or expired key: `op` runs and its response is stored with the
    ///   request hash in the same unit of work.
    /// - Key with a stored response and the same payload hash: the stored
    ///   status and body are returned and `op` does not run.
    /// - Key with a different payload hash: `Conflict`, `op` does not run.
    ///
    /// If `op` fails nothing is written, so a retry executes from scratch.
    #[instrument(skip(self, request, op), fields(tenant_id = %request.tenant_id, operation = request.operation))]
    pub async fn execute<F>(
        &self,
        request: IdempotentRequest<'_>,
        op: F,
    ) -> Result<GuardedResponse, AppError>
    where
        F: for<'u> FnOnce(
                &'u mut dyn UnitOfWork,
            ) -> BoxFuture<'u, Result<IdempotentResponse, AppError>>
            + Send,
    {
        let Some(key) = request.key else {
            let mut uow = self.store.begin().await?;
            let result = op(uow.as_mut()).await;
            let response = crate::services::store::finish(uow, result).await?;
            return Ok(GuardedResponse {
                status: response.status,
                body: response.body,
                replayed: false,
            });
        };

        validate_key(key)?;
        let request_hash = hash_payload(request.payload);

        let mut attempts = 0;
        let mut uow = loop {
            attempts += 1;
            let now = Utc::now();
            let mut uow = self.store.begin().await?;

            if let Some(existing) = uow
                .find_idempotency_record(request.tenant_id, key, request.operation, now)
                .await?
            {
                uow.rollback().await?;
                return self.resolve_existing(&request, existing, &request_hash);
            }

            let record = IdempotencyRecord {
                idempotency_key: key.to_string(),
                tenant_id: request.tenant_id,
                operation: request.operation.to_string(),
                request_hash: request_hash.clone(),
                response_status: None,
                response_body: None,
                created_utc: now,
                expires_utc: now + self.ttl,
            };

            if uow.claim_idempotency_key(&record).await? {
                break uow;
            }

            uow.rollback().await?;
            debug!(attempt = attempts, "Idempotency key claimed concurrently, re-reading");
            if attempts >= MAX_CLAIM_ATTEMPTS {
                record_idempotency_outcome(request.operation, "conflict");
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "A request with this idempotency key is already in progress"
                )));
            }
        };

        let result = op(uow.as_mut()).await;
        let response = match result {
            Ok(response) => response,
            Err(err) => {
                if let Err(rollback_err) = uow.rollback().await {
                    warn!(error = %rollback_err, "Rollback failed");
                }
                return Err(err);
            }
        };

        uow.store_idempotent_response(
            request.tenant_id,
            key,
            request.operation,
            i32::from(response.status.as_u16()),
            &response.body,
        )
        .await?;
        uow.commit().await?;

        record_idempotency_outcome(request.operation, "executed");
        info!(status = response.status.as_u16(), "Idempotent operation executed");

        Ok(GuardedResponse {
            status: response.status,
            body: response.body,
            replayed: false,
        })
    }

    fn resolve_existing(
        &self,
        request: &IdempotentRequest<'_>,
        existing: IdempotencyRecord,
        request_hash: &str,
    ) -> Result<GuardedResponse, AppError> {
        if existing.request_hash != request_hash {
            record_idempotency_outcome(request.operation, "conflict");
            warn!("Idempotency key reused with different payload");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Idempotency key reused with different request payload"
            )));
        }

        let (Some(status), Some(body)) = (existing.response_status, existing.response_body) else {
            record_idempotency_outcome(request.operation, "conflict");
            return Err(AppError::Conflict(anyhow::anyhow!(
                "A request with this idempotency key is already in progress"
            )));
        };

        let status = u16::try_from(status)
            .ok()
            .and_then(|s| StatusCode::from_u16(s).ok())
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Stored idempotent response has invalid status {}",
                    status
                ))
            })?;

        record_idempotency_outcome(request.operation, "replayed");
        info!(status = status.as_u16(), "Replaying stored idempotent response");

        Ok(GuardedResponse {
            status,
            body,
            replayed: true,
        })
    }

    /// Deletes expired records. Correctness never depends on this running.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let removed = self.store.purge_expired_idempotency_records(now).await?;
        record_idempotency_cleanup("removed", removed);
        if removed > 0 {
            info!(removed = removed, "Expired idempotency records purged");
        }
        Ok(removed)
    }

    /// Starts the periodic cleanup sweep. Failures are logged and the sweep
    /// keeps running.
    pub fn spawn_cleanup(&self, interval: std::time::Duration) -> JoinHandle<()> {
        let guard = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = guard.purge_expired(Utc::now()).await {
                    record_idempotency_cleanup("failed", 1);
                    warn!(error = %e, "Idempotency cleanup sweep failed");
                }
            }
        })
    }
}

fn validate_key(key: &str) -> Result<(), AppError> {
    if key.trim().is_empty() {
        return Err(AppError::invalid_field(
            "idempotency_key",
            "length",
            "Idempotency-Key must not be empty".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(AppError::invalid_field(
            "idempotency_key",
            "length",
            format!("Idempotency-Key must be at most {} characters", MAX_KEY_LENGTH),
        ));
    }
    Ok(())
}

/// SHA-256 hex digest of the payload's canonical JSON form (object keys
/// sorted at every depth, no insignificant whitespace).
pub fn hash_payload(payload: &Value) -> String {
    let mut canonical = String::new();
    write_canonical(payload, &mut canonical);
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(k.clone()).to_string());
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn hash_ignores_key_order() {
        let a = json!({"b": 1, "a": {"y": [1, 2], "x": null}});
        let b = json!({"a": {"x": null, "y": [1, 2]}, "b": 1});
        assert_eq!(hash_payload(&a), hash_payload(&b));
    }

    #[test]
    fn hash_distinguishes_values_and_array_order() {
        assert_ne!(
            hash_payload(&json!({"top": 5})),
            hash_payload(&json!({"top": 6}))
        );
        assert_ne!(hash_payload(&json!([1, 2])), hash_payload(&json!([2, 1])));
        assert_ne!(hash_payload(&json!("1")), hash_payload(&json!(1)));
    }

    #[test]
    fn hash_is_sha256_hex() {
        let digest = hash_payload(&json!({}));
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn key_must_be_non_empty_and_bounded() {
        assert!(validate_key("abc").is_ok());
        assert!(matches!(
            validate_key("  "),
            Err(AppError::ValidationError(_))
        ));
        assert!(matches!(
            validate_key(&"k".repeat(256)),
            Err(AppError::ValidationError(_))
        ));
    }

    #[test]
    fn replayed_response_carries_header() {
        let response = GuardedResponse {
            status: StatusCode::CREATED,
            body: "{}".to_string(),
            replayed: true,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers().get(IDEMPOTENT_REPLAYED_HEADER).unwrap(),
            "true"
        );
    }
}
