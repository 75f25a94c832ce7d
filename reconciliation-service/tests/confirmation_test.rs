//! Confirmation atomicity under storage failures and concurrent callers.

mod common;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::spawn_app;
use reconciliation_service::models::{
    BankTransaction, IdempotencyRecord, Invoice, InvoiceStatus, Match, MatchStatus, Vendor,
};
use reconciliation_service::services::explanation::ExplanationService;
use reconciliation_service::services::ranking::RankingOptions;
use reconciliation_service::services::store::{MemoryStore, Store, UnitOfWork};
use reconciliation_service::services::ReconciliationEngine;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Delegates to a [`MemoryStore`] but fails the invoice update, the last
/// write of a confirmation.
struct FailingInvoiceUpdateStore {
    inner: MemoryStore,
}

#[async_trait]
impl Store for FailingInvoiceUpdateStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        Ok(Box::new(FailingInvoiceUpdate {
            inner: self.inner.begin().await?,
        }))
    }

    async fn health_check(&self) -> Result<(), AppError> {
        self.inner.health_check().await
    }

    async fn purge_expired_idempotency_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        self.inner.purge_expired_idempotency_records(now).await
    }
}

struct FailingInvoiceUpdate {
    inner: Box<dyn UnitOfWork>,
}

#[async_trait]
impl UnitOfWork for FailingInvoiceUpdate {
    async fn vendor_names(&mut self, tenant_id: Uuid) -> Result<HashMap<Uuid, String>, AppError> {
        self.inner.vendor_names(tenant_id).await
    }

    async fn find_or_create_vendor(
        &mut self,
        tenant_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vendor, AppError> {
        self.inner.find_or_create_vendor(tenant_id, name, now).await
    }

    async fn list_open_invoices(&mut self, tenant_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        self.inner.list_open_invoices(tenant_id).await
    }

    async fn get_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.get_invoice(tenant_id, invoice_id).await
    }

    async fn lock_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        self.inner.lock_invoice(tenant_id, invoice_id).await
    }

    async fn mark_invoice_matched(
        &mut self,
        _tenant_id: Uuid,
        _invoice_id: Uuid,
        _transaction_id: Uuid,
        _now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        Err(AppError::DatabaseError(anyhow::anyhow!(
            "connection reset during invoice update"
        )))
    }

    async fn find_invoice_numbers(
        &mut self,
        tenant_id: Uuid,
        numbers: &[String],
    ) -> Result<Vec<String>, AppError> {
        self.inner.find_invoice_numbers(tenant_id, numbers).await
    }

    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), AppError> {
        self.inner.insert_invoice(invoice).await
    }

    async fn list_unmatched_transactions(
        &mut self,
        tenant_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        self.inner.list_unmatched_transactions(tenant_id).await
    }

    async fn get_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        self.inner.get_transaction(tenant_id, transaction_id).await
    }

    async fn find_transaction_external_ids(
        &mut self,
        tenant_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<String>, AppError> {
        self.inner
            .find_transaction_external_ids(tenant_id, external_ids)
            .await
    }

    async fn insert_transaction(&mut self, transaction: &BankTransaction) -> Result<(), AppError> {
        self.inner.insert_transaction(transaction).await
    }

    async fn insert_match(&mut self, record: &Match) -> Result<(), AppError> {
        self.inner.insert_match(record).await
    }

    async fn get_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        self.inner.get_match(tenant_id, match_id).await
    }

    async fn list_matches_for_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        self.inner
            .list_matches_for_invoice(tenant_id, invoice_id, status)
            .await
    }

    async fn list_matches_by_status(
        &mut self,
        tenant_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        self.inner.list_matches_by_status(tenant_id, status).await
    }

    async fn confirmed_match_for_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        self.inner
            .confirmed_match_for_transaction(tenant_id, transaction_id)
            .await
    }

    async fn confirm_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        self.inner.confirm_match(tenant_id, match_id, now).await
    }

    async fn reject_competing_matches(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        keep_match_id: Uuid,
    ) -> Result<u64, AppError> {
        self.inner
            .reject_competing_matches(tenant_id, invoice_id, keep_match_id)
            .await
    }

    async fn find_idempotency_record(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        self.inner
            .find_idempotency_record(tenant_id, key, operation, now)
            .await
    }

    async fn claim_idempotency_key(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<bool, AppError> {
        self.inner.claim_idempotency_key(record).await
    }

    async fn store_idempotent_response(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        status: i32,
        body: &str,
    ) -> Result<(), AppError> {
        self.inner
            .store_idempotent_response(tenant_id, key, operation, status, body)
            .await
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.inner.rollback().await
    }
}

#[tokio::test]
async fn failed_invoice_update_rolls_back_the_whole_confirmation() {
    let app = spawn_app();
    let (inv, _, _) = app.seed_competing_pair().await;

    let run = app
        .state
        .engine
        .run_reconciliation(app.tenant_id, RankingOptions::default())
        .await
        .unwrap();
    let target = run.candidates[0].match_id;

    let failing = ReconciliationEngine::new(
        Arc::new(FailingInvoiceUpdateStore {
            inner: app.store.clone(),
        }),
        RankingOptions::default(),
        ExplanationService::disabled(),
    );
    let err = failing
        .confirm_match(app.tenant_id, target)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::DatabaseError(_)));
    assert!(err.is_retryable());

    let engine = &app.state.engine;
    let proposed = engine
        .list_matches(app.tenant_id, Some(MatchStatus::Proposed))
        .await
        .unwrap();
    assert_eq!(proposed.len(), 2);
    assert!(proposed.iter().all(|m| m.confirmed_utc.is_none()));
    assert!(engine
        .list_matches(app.tenant_id, Some(MatchStatus::Rejected))
        .await
        .unwrap()
        .is_empty());

    let invoice = app.invoice(inv.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Open);
    assert_eq!(invoice.matched_transaction_id, None);

    // The untouched state still confirms normally.
    engine.confirm_match(app.tenant_id, target).await.unwrap();
    assert_eq!(
        app.invoice(inv.invoice_id).await.status,
        InvoiceStatus::Matched
    );
}

#[tokio::test]
async fn concurrent_competing_confirmations_admit_one_winner() {
    let app = spawn_app();
    let (inv, _, _) = app.seed_competing_pair().await;
    let engine = &app.state.engine;

    let run = engine
        .run_reconciliation(app.tenant_id, RankingOptions::default())
        .await
        .unwrap();
    let first = run.candidates[0].match_id;
    let second = run.candidates[1].match_id;

    let (a, b) = tokio::join!(
        engine.confirm_match(app.tenant_id, first),
        engine.confirm_match(app.tenant_id, second),
    );

    let winner = match (a, b) {
        (Ok(m), Err(AppError::Conflict(_))) | (Err(AppError::Conflict(_)), Ok(m)) => m,
        other => panic!("expected one success and one conflict, got {:?}", other),
    };
    assert_eq!(winner.status, MatchStatus::Confirmed);

    let confirmed = engine
        .list_matches(app.tenant_id, Some(MatchStatus::Confirmed))
        .await
        .unwrap();
    assert_eq!(confirmed.len(), 1);
    assert_eq!(confirmed[0].match_id, winner.match_id);

    let invoice = app.invoice(inv.invoice_id).await;
    assert_eq!(invoice.status, InvoiceStatus::Matched);
    assert_eq!(invoice.matched_transaction_id, Some(winner.transaction_id));
}
