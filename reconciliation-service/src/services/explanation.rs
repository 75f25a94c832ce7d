//! Optional natural-language explanations of proposed matches.
//!
//! The provider is best effort. Any failure downgrades the answer to the
//! stored heuristic reason with `source = fallback`; it never fails the call.

use crate::models::{BankTransaction, Invoice, Match};
use crate::services::metrics::record_explanation;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use service_core::retry::{retry_with_backoff, RetryConfig};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ExplanationError {
    #[error("explanation provider is not configured")]
    NotConfigured,

    #[error("explanation provider timed out after {0} ms")]
    Timeout(u64),

    #[error("explanation provider rate limited the request")]
    RateLimited,

    #[error("explanation provider unreachable: {0}")]
    Network(String),

    #[error("explanation provider returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed explanation response: {0}")]
    MalformedResponse(String),
}

impl ExplanationError {
    /// Transient failures worth another attempt. Auth errors, client errors
    /// and malformed payloads are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited | Self::Network(_) => true,
            Self::Api { status, .. } => *status >= 500,
            Self::NotConfigured | Self::MalformedResponse(_) => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiExplanation {
    pub explanation: String,
    /// 0..=100
    pub confidence: u8,
}

#[async_trait]
pub trait ExplanationProvider: Send + Sync {
    async fn explain(
        &self,
        invoice: &Invoice,
        transaction: &BankTransaction,
        heuristic_score: Decimal,
        heuristic_reason: &str,
    ) -> Result<AiExplanation, ExplanationError>;
}

// ============================================================================
// HTTP provider
// ============================================================================

#[derive(Debug, Serialize)]
struct ExplainRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    invoice: InvoiceContext<'a>,
    transaction: TransactionContext<'a>,
    heuristic_score: Decimal,
    heuristic_reason: &'a str,
}

#[derive(Debug, Serialize)]
struct InvoiceContext<'a> {
    invoice_number: Option<&'a str>,
    amount: Decimal,
    currency: &'a str,
    invoice_date: Option<chrono::NaiveDate>,
    description: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct TransactionContext<'a> {
    external_id: Option<&'a str>,
    amount: Decimal,
    currency: &'a str,
    posted_utc: chrono::DateTime<chrono::Utc>,
    description: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ExplainResponse {
    explanation: Option<String>,
    confidence: Option<i64>,
}

/// Posts the match context as JSON to a generative endpoint and expects
/// `{"explanation": "...", "confidence": 0..=100}` back.
#[derive(Clone)]
pub struct HttpExplanationProvider {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    model: Option<String>,
}

impl HttpExplanationProvider {
    pub fn new(endpoint: String, api_key: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            api_key,
            model,
        }
    }
}

#[async_trait]
impl ExplanationProvider for HttpExplanationProvider {
    async fn explain(
        &self,
        invoice: &Invoice,
        transaction: &BankTransaction,
        heuristic_score: Decimal,
        heuristic_reason: &str,
    ) -> Result<AiExplanation, ExplanationError> {
        if self.endpoint.is_empty() {
            return Err(ExplanationError::NotConfigured);
        }

        let request = ExplainRequest {
            model: self.model.as_deref(),
            invoice: InvoiceContext {
                invoice_number: invoice.invoice_number.as_deref(),
                amount: invoice.amount,
                currency: &invoice.currency,
                invoice_date: invoice.invoice_date,
                description: invoice.description.as_deref(),
            },
            transaction: TransactionContext {
                external_id: transaction.external_id.as_deref(),
                amount: transaction.amount,
                currency: &transaction.currency,
                posted_utc: transaction.posted_utc,
                description: transaction.description.as_deref(),
            },
            heuristic_score,
            heuristic_reason,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ExplanationError::Timeout(0)
            } else {
                ExplanationError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ExplanationError::Network(e.to_string()))?;

        tracing::debug!(status = %status, "Explanation provider response");

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(ExplanationError::RateLimited);
        }
        if !status.is_success() {
            return Err(ExplanationError::Api {
                status: status.as_u16(),
                message: body.chars().take(200).collect(),
            });
        }

        parse_explanation(&body)
    }
}

fn parse_explanation(body: &str) -> Result<AiExplanation, ExplanationError> {
    let parsed: ExplainResponse = serde_json::from_str(body)
        .map_err(|e| ExplanationError::MalformedResponse(e.to_string()))?;

    let explanation = parsed
        .explanation
        .filter(|e| !e.trim().is_empty())
        .ok_or_else(|| ExplanationError::MalformedResponse("missing 'explanation'".into()))?;
    let confidence = parsed
        .confidence
        .ok_or_else(|| ExplanationError::MalformedResponse("missing 'confidence'".into()))?;
    let confidence = u8::try_from(confidence)
        .ok()
        .filter(|c| *c <= 100)
        .ok_or_else(|| {
            ExplanationError::MalformedResponse(format!(
                "confidence must be 0-100, got {}",
                confidence
            ))
        })?;

    Ok(AiExplanation {
        explanation,
        confidence,
    })
}

// ============================================================================
// Fallback policy
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExplanationSource {
    Heuristic,
    Ai,
    Fallback,
}

impl ExplanationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Heuristic => "heuristic",
            Self::Ai => "ai",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Explanation {
    pub match_id: Uuid,
    pub heuristic_score: Decimal,
    pub heuristic_reason: String,
    pub ai_explanation: Option<String>,
    pub ai_confidence: Option<u8>,
    pub source: ExplanationSource,
    pub ai_error_message: Option<String>,
}

/// Applies the timeout, retry and fallback contract around an optional provider.
#[derive(Clone)]
pub struct ExplanationService {
    provider: Option<Arc<dyn ExplanationProvider>>,
    timeout: Duration,
    retry: RetryConfig,
}

impl ExplanationService {
    pub fn new(
        provider: Option<Arc<dyn ExplanationProvider>>,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Self {
        Self {
            provider,
            timeout,
            retry,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None, Duration::from_secs(10), RetryConfig::no_retry())
    }

    /// `timeout` bounds all attempts together, backoff included.
    pub async fn explain(
        &self,
        record: &Match,
        invoice: &Invoice,
        transaction: &BankTransaction,
    ) -> Explanation {
        let mut explanation = Explanation {
            match_id: record.match_id,
            heuristic_score: record.score,
            heuristic_reason: record.reason.clone(),
            ai_explanation: None,
            ai_confidence: None,
            source: ExplanationSource::Heuristic,
            ai_error_message: None,
        };

        let Some(provider) = &self.provider else {
            record_explanation(explanation.source.as_str());
            return explanation;
        };

        let attempts = retry_with_backoff(
            &self.retry,
            "explain_match",
            ExplanationError::is_retryable,
            || provider.explain(invoice, transaction, record.score, &record.reason),
        );

        let outcome = match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(ExplanationError::Timeout(self.timeout.as_millis() as u64)),
        };

        match outcome {
            Ok(ai) => {
                explanation.ai_explanation = Some(ai.explanation);
                explanation.ai_confidence = Some(ai.confidence);
                explanation.source = ExplanationSource::Ai;
            }
            Err(e) => {
                tracing::warn!(
                    match_id = %record.match_id,
                    error = %e,
                    "Explanation provider failed, falling back to heuristic reason"
                );
                explanation.source = ExplanationSource::Fallback;
                explanation.ai_error_message = Some(e.to_string());
            }
        }

        record_explanation(explanation.source.as_str());
        explanation
    }
}
