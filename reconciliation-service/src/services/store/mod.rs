//! Storage collaborator seam.
//!
//! A [`Store`] opens [`UnitOfWork`]s. Every read and write issued through a
//! unit of work is tenant-scoped and becomes visible to other units only on
//! [`UnitOfWork::commit`]. Dropping a unit of work without committing rolls it
//! back.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::models::{BankTransaction, IdempotencyRecord, Invoice, Match, MatchStatus, Vendor};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError>;

    async fn health_check(&self) -> Result<(), AppError>;

    /// Deletes idempotency records with `expires_utc <= now`. Returns the
    /// number of rows removed.
    async fn purge_expired_idempotency_records(&self, now: DateTime<Utc>)
        -> Result<u64, AppError>;
}

#[async_trait]
pub trait UnitOfWork: Send {
    // Vendors

    async fn vendor_names(&mut self, tenant_id: Uuid) -> Result<HashMap<Uuid, String>, AppError>;

    async fn find_or_create_vendor(
        &mut self,
        tenant_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vendor, AppError>;

    // Invoices

    async fn list_open_invoices(&mut self, tenant_id: Uuid) -> Result<Vec<Invoice>, AppError>;

    async fn get_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError>;

    /// Reads the invoice and holds a row lock on it until the unit ends.
    async fn lock_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError>;

    async fn mark_invoice_matched(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Returns the subset of `numbers` already used by the tenant's invoices.
    async fn find_invoice_numbers(
        &mut self,
        tenant_id: Uuid,
        numbers: &[String],
    ) -> Result<Vec<String>, AppError>;

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), AppError>;

    // Bank transactions

    /// Transactions not referenced by any confirmed match.
    async fn list_unmatched_transactions(
        &mut self,
        tenant_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError>;

    async fn get_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError>;

    /// Returns the subset of `external_ids` already imported for the tenant.
    async fn find_transaction_external_ids(
        &mut self,
        tenant_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<String>, AppError>;

    async fn insert_transaction(&mut self, transaction: &BankTransaction) -> Result<(), AppError>;

    // Matches

    async fn insert_match(&mut self, record: &Match) -> Result<(), AppError>;

    async fn get_match(&mut self, tenant_id: Uuid, match_id: Uuid)
        -> Result<Option<Match>, AppError>;

    async fn list_matches_for_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError>;

    /// Ordered by score descending, then creation time.
    async fn list_matches_by_status(
        &mut self,
        tenant_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError>;

    async fn confirmed_match_for_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Match>, AppError>;

    /// Sets status `confirmed` and the confirmation timestamp. A second
    /// confirmed match for the same invoice is a `Conflict`.
    async fn confirm_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError>;

    /// Moves every `proposed` match of the invoice other than `keep_match_id`
    /// to `rejected`. Returns the number of matches changed.
    async fn reject_competing_matches(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        keep_match_id: Uuid,
    ) -> Result<u64, AppError>;

    // Idempotency records

    /// Returns the record for the tuple unless it has expired at `now`.
    async fn find_idempotency_record(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AppError>;

    /// Inserts `record` unless an unexpired record holds the same
    /// (key, tenant, operation) tuple. An expired holder is replaced. Returns
    /// whether this unit now owns the key.
    async fn claim_idempotency_key(&mut self, record: &IdempotencyRecord)
        -> Result<bool, AppError>;

    async fn store_idempotent_response(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        status: i32,
        body: &str,
    ) -> Result<(), AppError>;

    async fn commit(self: Box<Self>) -> Result<(), AppError>;

    async fn rollback(self: Box<Self>) -> Result<(), AppError>;
}

/// Commits `uow` when `result` is `Ok`, rolls it back otherwise, and hands
/// `result` back. A failed rollback is logged and the original error kept.
pub async fn finish<T>(
    uow: Box<dyn UnitOfWork>,
    result: Result<T, AppError>,
) -> Result<T, AppError> {
    match result {
        Ok(value) => {
            uow.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = uow.rollback().await {
                tracing::warn!(error = %rollback_err, "Rollback failed");
            }
            Err(err)
        }
    }
}
