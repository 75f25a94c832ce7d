//! Domain models for reconciliation-service.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A status string read from storage that no enum variant accepts.
#[derive(Debug, thiserror::Error)]
#[error("unknown {kind} status '{value}'")]
pub struct UnknownStatus {
    kind: &'static str,
    value: String,
}

// ============================================================================
// Vendor Models
// ============================================================================

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Vendor {
    pub vendor_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Invoice Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Open,
    Matched,
    Paid,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Matched => "matched",
            Self::Paid => "paid",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "open" => Ok(Self::Open),
            "matched" => Ok(Self::Matched),
            "paid" => Ok(Self::Paid),
            other => Err(UnknownStatus {
                kind: "invoice",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for InvoiceStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Invoice {
    pub invoice_id: Uuid,
    pub tenant_id: Uuid,
    pub vendor_id: Option<Uuid>,
    pub invoice_number: Option<String>,
    pub amount: Decimal,
    pub currency: String,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: InvoiceStatus,
    pub matched_transaction_id: Option<Uuid>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

// ============================================================================
// Bank Transaction Models
// ============================================================================

/// Imported bank movement. Never mutated after insert.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct BankTransaction {
    pub transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub external_id: Option<String>,
    pub posted_utc: DateTime<Utc>,
    pub amount: Decimal,
    pub currency: String,
    pub description: Option<String>,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Match Models
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Proposed,
    Confirmed,
    Rejected,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Result<Self, UnknownStatus> {
        match s {
            "proposed" => Ok(Self::Proposed),
            "confirmed" => Ok(Self::Confirmed),
            "rejected" => Ok(Self::Rejected),
            other => Err(UnknownStatus {
                kind: "match",
                value: other.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for MatchStatus {
    type Error = UnknownStatus;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// A scored invoice/transaction pairing. `score` and `reason` are fixed at
/// creation; only `status` and `confirmed_utc` change afterwards.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Match {
    pub match_id: Uuid,
    pub tenant_id: Uuid,
    pub invoice_id: Uuid,
    pub transaction_id: Uuid,
    pub score: Decimal,
    #[sqlx(try_from = "String")]
    pub status: MatchStatus,
    pub reason: String,
    pub confirmed_utc: Option<DateTime<Utc>>,
    pub created_utc: DateTime<Utc>,
}

// ============================================================================
// Idempotency Models
// ============================================================================

/// Stored outcome of a keyed mutating request. A record without a response
/// belongs to an attempt that has not committed yet.
#[derive(Debug, Clone, FromRow)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub tenant_id: Uuid,
    pub operation: String,
    pub request_hash: String,
    pub response_status: Option<i32>,
    pub response_body: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_utc <= now
    }
}
