//! In-process store for tests and local runs.
//!
//! Units of work are serialised: `begin` takes an owned lock on the whole
//! state and works on a copy, `commit` writes the copy back. This gives every
//! unit a serializable view and makes the row lock in `lock_invoice` implicit.

use super::{Store, UnitOfWork};
use crate::models::{
    BankTransaction, IdempotencyRecord, Invoice, InvoiceStatus, Match, MatchStatus, Vendor,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    vendors: Vec<Vendor>,
    invoices: Vec<Invoice>,
    transactions: Vec<BankTransaction>,
    matches: Vec<Match>,
    idempotency: Vec<IdempotencyRecord>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored match rows for the tenant, across all statuses.
    pub async fn match_count(&self, tenant_id: Uuid) -> usize {
        let state = self.state.lock().await;
        state
            .matches
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .count()
    }

    /// Number of stored idempotency rows, expired or not.
    pub async fn idempotency_record_count(&self) -> usize {
        self.state.lock().await.idempotency.len()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(Box::new(MemoryUnitOfWork { guard, working }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }

    async fn purge_expired_idempotency_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let mut state = self.state.lock().await;
        let before = state.idempotency.len();
        state.idempotency.retain(|r| !r.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}

pub struct MemoryUnitOfWork {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryUnitOfWork {
    fn match_mut(&mut self, tenant_id: Uuid, match_id: Uuid) -> Option<&mut Match> {
        self.working
            .matches
            .iter_mut()
            .find(|m| m.tenant_id == tenant_id && m.match_id == match_id)
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn vendor_names(&mut self, tenant_id: Uuid) -> Result<HashMap<Uuid, String>, AppError> {
        Ok(self
            .working
            .vendors
            .iter()
            .filter(|v| v.tenant_id == tenant_id)
            .map(|v| (v.vendor_id, v.name.clone()))
            .collect())
    }

    async fn find_or_create_vendor(
        &mut self,
        tenant_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vendor, AppError> {
        if let Some(existing) = self
            .working
            .vendors
            .iter()
            .find(|v| v.tenant_id == tenant_id && v.name == name)
        {
            return Ok(existing.clone());
        }

        let vendor = Vendor {
            vendor_id: Uuid::new_v4(),
            tenant_id,
            name: name.to_string(),
            created_utc: now,
        };
        self.working.vendors.push(vendor.clone());
        Ok(vendor)
    }

    async fn list_open_invoices(&mut self, tenant_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let mut invoices: Vec<Invoice> = self
            .working
            .invoices
            .iter()
            .filter(|i| i.tenant_id == tenant_id && i.status == InvoiceStatus::Open)
            .cloned()
            .collect();
        invoices.sort_by_key(|i| i.invoice_id);
        Ok(invoices)
    }

    async fn get_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .find(|i| i.tenant_id == tenant_id && i.invoice_id == invoice_id)
            .cloned())
    }

    async fn lock_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.get_invoice(tenant_id, invoice_id).await
    }

    async fn mark_invoice_matched(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let invoice = self
            .working
            .invoices
            .iter_mut()
            .find(|i| i.tenant_id == tenant_id && i.invoice_id == invoice_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", invoice_id))
            })?;

        invoice.status = InvoiceStatus::Matched;
        invoice.matched_transaction_id = Some(transaction_id);
        invoice.updated_utc = now;
        Ok(())
    }

    async fn find_invoice_numbers(
        &mut self,
        tenant_id: Uuid,
        numbers: &[String],
    ) -> Result<Vec<String>, AppError> {
        Ok(self
            .working
            .invoices
            .iter()
            .filter(|i| i.tenant_id == tenant_id)
            .filter_map(|i| i.invoice_number.clone())
            .filter(|n| numbers.contains(n))
            .collect())
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), AppError> {
        if let Some(number) = &invoice.invoice_number {
            let taken = self.working.invoices.iter().any(|i| {
                i.tenant_id == invoice.tenant_id && i.invoice_number.as_ref() == Some(number)
            });
            if taken {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice number '{}' already exists for tenant",
                    number
                )));
            }
        }
        self.working.invoices.push(invoice.clone());
        Ok(())
    }

    async fn list_unmatched_transactions(
        &mut self,
        tenant_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let confirmed: Vec<Uuid> = self
            .working
            .matches
            .iter()
            .filter(|m| m.status == MatchStatus::Confirmed)
            .map(|m| m.transaction_id)
            .collect();

        let mut transactions: Vec<BankTransaction> = self
            .working
            .transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id && !confirmed.contains(&t.transaction_id))
            .cloned()
            .collect();
        transactions.sort_by_key(|t| (t.posted_utc, t.transaction_id));
        Ok(transactions)
    }

    async fn get_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        Ok(self
            .working
            .transactions
            .iter()
            .find(|t| t.tenant_id == tenant_id && t.transaction_id == transaction_id)
            .cloned())
    }

    async fn find_transaction_external_ids(
        &mut self,
        tenant_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<String>, AppError> {
        Ok(self
            .working
            .transactions
            .iter()
            .filter(|t| t.tenant_id == tenant_id)
            .filter_map(|t| t.external_id.clone())
            .filter(|e| external_ids.contains(e))
            .collect())
    }

    async fn insert_transaction(&mut self, transaction: &BankTransaction) -> Result<(), AppError> {
        if let Some(external_id) = &transaction.external_id {
            let taken = self.working.transactions.iter().any(|t| {
                t.tenant_id == transaction.tenant_id && t.external_id.as_ref() == Some(external_id)
            });
            if taken {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Transaction with external_id '{}' already exists",
                    external_id
                )));
            }
        }
        self.working.transactions.push(transaction.clone());
        Ok(())
    }

    async fn insert_match(&mut self, record: &Match) -> Result<(), AppError> {
        self.working.matches.push(record.clone());
        Ok(())
    }

    async fn get_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        Ok(self
            .working
            .matches
            .iter()
            .find(|m| m.tenant_id == tenant_id && m.match_id == match_id)
            .cloned())
    }

    async fn list_matches_for_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        let mut records: Vec<Match> = self
            .working
            .matches
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.invoice_id == invoice_id)
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|m| (m.created_utc, m.match_id));
        Ok(records)
    }

    async fn list_matches_by_status(
        &mut self,
        tenant_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        let mut records: Vec<Match> = self
            .working
            .matches
            .iter()
            .filter(|m| m.tenant_id == tenant_id)
            .filter(|m| status.map_or(true, |s| m.status == s))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.created_utc.cmp(&b.created_utc))
                .then_with(|| a.match_id.cmp(&b.match_id))
        });
        Ok(records)
    }

    async fn confirmed_match_for_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        Ok(self
            .working
            .matches
            .iter()
            .find(|m| {
                m.tenant_id == tenant_id
                    && m.transaction_id == transaction_id
                    && m.status == MatchStatus::Confirmed
            })
            .cloned())
    }

    async fn confirm_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let (invoice_id, transaction_id) = self
            .match_mut(tenant_id, match_id)
            .map(|m| (m.invoice_id, m.transaction_id))
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Match {} not found", match_id)))?;

        let clash = self.working.matches.iter().any(|m| {
            m.match_id != match_id
                && m.status == MatchStatus::Confirmed
                && (m.invoice_id == invoice_id || m.transaction_id == transaction_id)
        });
        if clash {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice or transaction of match {} is already confirmed",
                match_id
            )));
        }

        if let Some(record) = self.match_mut(tenant_id, match_id) {
            record.status = MatchStatus::Confirmed;
            record.confirmed_utc = Some(now);
        }
        Ok(())
    }

    async fn reject_competing_matches(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        keep_match_id: Uuid,
    ) -> Result<u64, AppError> {
        let mut rejected = 0;
        for record in self.working.matches.iter_mut().filter(|m| {
            m.tenant_id == tenant_id
                && m.invoice_id == invoice_id
                && m.match_id != keep_match_id
                && m.status == MatchStatus::Proposed
        }) {
            record.status = MatchStatus::Rejected;
            rejected += 1;
        }
        Ok(rejected)
    }

    async fn find_idempotency_record(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        Ok(self
            .working
            .idempotency
            .iter()
            .find(|r| {
                r.tenant_id == tenant_id
                    && r.idempotency_key == key
                    && r.operation == operation
                    && !r.is_expired(now)
            })
            .cloned())
    }

    async fn claim_idempotency_key(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<bool, AppError> {
        let same_tuple = |r: &IdempotencyRecord| {
            r.tenant_id == record.tenant_id
                && r.idempotency_key == record.idempotency_key
                && r.operation == record.operation
        };

        let now = record.created_utc;
        self.working
            .idempotency
            .retain(|r| !(same_tuple(r) && r.is_expired(now)));

        if self.working.idempotency.iter().any(same_tuple) {
            return Ok(false);
        }
        self.working.idempotency.push(record.clone());
        Ok(true)
    }

    async fn store_idempotent_response(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        status: i32,
        body: &str,
    ) -> Result<(), AppError> {
        let record = self
            .working
            .idempotency
            .iter_mut()
            .find(|r| r.tenant_id == tenant_id && r.idempotency_key == key && r.operation == operation)
            .ok_or_else(|| {
                AppError::InternalError(anyhow::anyhow!(
                    "Idempotency record for operation '{}' vanished before response was stored",
                    operation
                ))
            })?;

        record.response_status = Some(status);
        record.response_body = Some(body.to_string());
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        let MemoryUnitOfWork { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        Ok(())
    }
}
