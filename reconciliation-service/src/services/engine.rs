//! Reconciliation engine: proposal runs and the match confirmation state machine.
//!
//! Every operation comes in two forms. `foo_in` runs against a caller-owned
//! [`UnitOfWork`] so the idempotency guard can commit business writes and its
//! cached response together. `foo` opens and finishes its own unit of work.

use crate::models::{BankTransaction, Invoice, InvoiceStatus, Match, MatchStatus};
use crate::services::explanation::{Explanation, ExplanationService};
use crate::services::metrics::{
    record_confirmation, record_match_proposed, record_reconciliation_run,
};
use crate::services::ranking::{self, RankingOptions};
use crate::services::store::{finish, Store, UnitOfWork};
use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use service_core::error::AppError;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Result of one reconciliation run. `candidates` are the persisted proposals.
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub total: usize,
    pub returned: usize,
    pub candidates: Vec<Match>,
}

#[derive(Clone)]
pub struct ReconciliationEngine {
    store: Arc<dyn Store>,
    defaults: RankingOptions,
    explanations: ExplanationService,
}

impl ReconciliationEngine {
    pub fn new(
        store: Arc<dyn Store>,
        defaults: RankingOptions,
        explanations: ExplanationService,
    ) -> Self {
        Self {
            store,
            defaults,
            explanations,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Resolves caller-supplied ranking parameters against the configured defaults.
    pub fn ranking_options(
        &self,
        top: Option<i64>,
        min_score: Option<Decimal>,
    ) -> Result<RankingOptions, AppError> {
        RankingOptions::resolve(top, min_score, self.defaults)
    }

    // ========================================================================
    // Run phase
    // ========================================================================

    pub async fn run_reconciliation(
        &self,
        tenant_id: Uuid,
        options: RankingOptions,
    ) -> Result<ReconciliationResult, AppError> {
        let mut uow = self.store.begin().await?;
        let result = self
            .run_reconciliation_in(uow.as_mut(), tenant_id, options)
            .await;
        finish(uow, result).await
    }

    /// Ranks open invoices against unmatched transactions and persists one
    /// `proposed` match per returned candidate. Existing proposals are left
    /// untouched.
    #[instrument(skip(self, uow, options), fields(tenant_id = %tenant_id, top = options.top, min_score = %options.min_score))]
    pub async fn run_reconciliation_in(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        options: RankingOptions,
    ) -> Result<ReconciliationResult, AppError> {
        let result = self.propose(uow, tenant_id, options).await;
        match &result {
            Ok(run) if run.returned == 0 => record_reconciliation_run("empty"),
            Ok(_) => record_reconciliation_run("completed"),
            Err(_) => record_reconciliation_run("failed"),
        }
        result
    }

    async fn propose(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        options: RankingOptions,
    ) -> Result<ReconciliationResult, AppError> {
        let invoices = uow.list_open_invoices(tenant_id).await?;
        let transactions = uow.list_unmatched_transactions(tenant_id).await?;

        if invoices.is_empty() || transactions.is_empty() {
            info!(
                invoices = invoices.len(),
                transactions = transactions.len(),
                "Nothing to reconcile"
            );
            return Ok(ReconciliationResult {
                total: 0,
                returned: 0,
                candidates: Vec::new(),
            });
        }

        let vendor_names = uow.vendor_names(tenant_id).await?;
        let ranking = ranking::rank(&invoices, &transactions, &vendor_names, options);

        let now = Utc::now();
        let mut persisted = Vec::with_capacity(ranking.candidates.len());
        for candidate in ranking.candidates {
            let record = Match {
                match_id: Uuid::new_v4(),
                tenant_id,
                invoice_id: candidate.invoice.invoice_id,
                transaction_id: candidate.transaction.transaction_id,
                score: candidate.score.score,
                status: MatchStatus::Proposed,
                reason: candidate.score.reason,
                confirmed_utc: None,
                created_utc: now,
            };
            uow.insert_match(&record).await?;
            record_match_proposed(score_band(record.score));
            persisted.push(record);
        }

        info!(
            invoices = invoices.len(),
            transactions = transactions.len(),
            total = ranking.total,
            returned = persisted.len(),
            "Reconciliation run proposed matches"
        );

        Ok(ReconciliationResult {
            total: ranking.total,
            returned: persisted.len(),
            candidates: persisted,
        })
    }

    // ========================================================================
    // Confirmation
    // ========================================================================

    pub async fn confirm_match(&self, tenant_id: Uuid, match_id: Uuid) -> Result<Match, AppError> {
        let mut uow = self.store.begin().await?;
        let result = self.confirm_match_in(uow.as_mut(), tenant_id, match_id).await;
        finish(uow, result).await
    }

    /// Confirms `match_id`, rejects the invoice's other proposals and marks
    /// the invoice matched. The three writes share `uow`; nothing is applied
    /// unless it commits.
    ///
    /// Re-confirming a match that is already confirmed returns it unchanged.
    #[instrument(skip(self, uow), fields(tenant_id = %tenant_id, match_id = %match_id))]
    pub async fn confirm_match_in(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<Match, AppError> {
        let result = self.apply_confirmation(uow, tenant_id, match_id).await;
        match &result {
            Ok((_, true)) => record_confirmation("confirmed"),
            Ok((_, false)) => record_confirmation("noop"),
            Err(AppError::Conflict(e)) => {
                warn!(error = %e, "Confirmation rejected");
                record_confirmation("conflict");
            }
            Err(AppError::NotFound(_)) => record_confirmation("not_found"),
            Err(_) => record_confirmation("failed"),
        }
        result.map(|(record, _)| record)
    }

    /// Returns the match and whether this call changed anything.
    async fn apply_confirmation(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<(Match, bool), AppError> {
        let target = uow
            .get_match(tenant_id, match_id)
            .await?
            .ok_or_else(|| match_not_found(match_id))?;

        let invoice = uow
            .lock_invoice(tenant_id, target.invoice_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!("Invoice {} not found", target.invoice_id))
            })?;

        // The invoice lock serializes confirmations for this invoice; read the
        // match again under it.
        let target = uow
            .get_match(tenant_id, match_id)
            .await?
            .ok_or_else(|| match_not_found(match_id))?;

        let confirmed = uow
            .list_matches_for_invoice(tenant_id, invoice.invoice_id, Some(MatchStatus::Confirmed))
            .await?;
        if let Some(competing) = confirmed.iter().find(|m| m.match_id != match_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Invoice {} already matched to transaction {}",
                invoice.invoice_id,
                competing.transaction_id
            )));
        }

        match target.status {
            MatchStatus::Confirmed => {
                info!("Match already confirmed");
                return Ok((target, false));
            }
            MatchStatus::Rejected => {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Match {} was rejected and cannot be confirmed",
                    match_id
                )));
            }
            MatchStatus::Proposed => {}
        }

        if invoice.status != InvoiceStatus::Open {
            return Err(match invoice.matched_transaction_id {
                Some(transaction_id) => AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} already matched to transaction {}",
                    invoice.invoice_id,
                    transaction_id
                )),
                None => AppError::Conflict(anyhow::anyhow!(
                    "Invoice {} is {} and cannot be matched",
                    invoice.invoice_id,
                    invoice.status.as_str()
                )),
            });
        }

        if let Some(other) = uow
            .confirmed_match_for_transaction(tenant_id, target.transaction_id)
            .await?
        {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Transaction {} already matched to invoice {}",
                target.transaction_id,
                other.invoice_id
            )));
        }

        let now = Utc::now();
        uow.confirm_match(tenant_id, match_id, now).await?;
        let rejected = uow
            .reject_competing_matches(tenant_id, invoice.invoice_id, match_id)
            .await?;
        uow.mark_invoice_matched(tenant_id, invoice.invoice_id, target.transaction_id, now)
            .await?;

        info!(
            invoice_id = %invoice.invoice_id,
            transaction_id = %target.transaction_id,
            rejected = rejected,
            "Match confirmed"
        );

        Ok((
            Match {
                status: MatchStatus::Confirmed,
                confirmed_utc: Some(now),
                ..target
            },
            true,
        ))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn list_matches(
        &self,
        tenant_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        let mut uow = self.store.begin().await?;
        let result = uow.list_matches_by_status(tenant_id, status).await;
        finish(uow, result).await
    }

    /// Reads the match and both sides in a unit of work that is closed before
    /// the explanation provider is consulted.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, match_id = %match_id))]
    pub async fn explain_match(
        &self,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<Explanation, AppError> {
        let mut uow = self.store.begin().await?;
        let loaded = load_match_context(uow.as_mut(), tenant_id, match_id).await;
        let (record, invoice, transaction) = finish(uow, loaded).await?;

        Ok(self
            .explanations
            .explain(&record, &invoice, &transaction)
            .await)
    }
}

async fn load_match_context(
    uow: &mut dyn UnitOfWork,
    tenant_id: Uuid,
    match_id: Uuid,
) -> Result<(Match, Invoice, BankTransaction), AppError> {
    let record = uow
        .get_match(tenant_id, match_id)
        .await?
        .ok_or_else(|| match_not_found(match_id))?;
    let invoice = uow
        .get_invoice(tenant_id, record.invoice_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Invoice {} not found", record.invoice_id))
        })?;
    let transaction = uow
        .get_transaction(tenant_id, record.transaction_id)
        .await?
        .ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!(
                "Transaction {} not found",
                record.transaction_id
            ))
        })?;
    Ok((record, invoice, transaction))
}

fn match_not_found(match_id: Uuid) -> AppError {
    AppError::NotFound(anyhow::anyhow!("Match {} not found", match_id))
}

fn score_band(score: Decimal) -> &'static str {
    if score >= Decimal::from(90) {
        "high"
    } else if score >= Decimal::from(75) {
        "medium"
    } else {
        "low"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_bands() {
        assert_eq!(score_band(Decimal::ONE_HUNDRED), "high");
        assert_eq!(score_band(Decimal::from(90)), "high");
        assert_eq!(score_band(Decimal::new(8999, 2)), "medium");
        assert_eq!(score_band(Decimal::from(75)), "medium");
        assert_eq!(score_band(Decimal::from(60)), "low");
    }
}
