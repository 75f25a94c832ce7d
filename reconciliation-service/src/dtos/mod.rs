//! Request and response shapes for the REST surface.

use crate::models::{BankTransaction, Invoice};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize)]
pub struct ReconcileQuery {
    pub top: Option<i64>,
    pub min_score: Option<Decimal>,
}

#[derive(Debug, Deserialize)]
pub struct ListMatchesQuery {
    pub status: Option<String>,
}

// ============================================================================
// Bank transaction import
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TransactionImportItem {
    #[validate(length(min = 1, max = 255))]
    pub external_id: Option<String>,
    pub posted_utc: DateTime<Utc>,
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImportTransactionsRequest {
    #[validate(length(min = 1, max = 1000), nested)]
    pub transactions: Vec<TransactionImportItem>,
}

#[derive(Debug, Serialize)]
pub struct ImportTransactionsResponse {
    pub imported_count: usize,
    pub transactions: Vec<BankTransaction>,
}

// ============================================================================
// Invoice import
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct InvoiceImportItem {
    #[validate(length(min = 1, max = 100))]
    pub invoice_number: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub vendor_name: Option<String>,
    pub amount: Decimal,
    #[validate(length(equal = 3))]
    pub currency: String,
    pub invoice_date: Option<NaiveDate>,
    pub due_date: Option<NaiveDate>,
    #[validate(length(max = 1000))]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ImportInvoicesRequest {
    #[validate(length(min = 1, max = 1000), nested)]
    pub invoices: Vec<InvoiceImportItem>,
}

#[derive(Debug, Serialize)]
pub struct ImportInvoicesResponse {
    pub imported_count: usize,
    pub invoices: Vec<Invoice>,
}
