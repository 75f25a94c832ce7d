//! Candidate ranking over every open invoice × unmatched transaction pair.

use crate::models::{BankTransaction, Invoice};
use crate::services::scoring::{self, ScoreResult};
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashMap;
use uuid::Uuid;

/// Validated ranking parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingOptions {
    pub top: usize,
    pub min_score: Decimal,
}

impl RankingOptions {
    /// Applies `defaults` for omitted values and rejects a negative `top` or
    /// a threshold outside `[0, 100]`.
    pub fn resolve(
        top: Option<i64>,
        min_score: Option<Decimal>,
        defaults: RankingOptions,
    ) -> Result<Self, AppError> {
        let top = match top {
            None => defaults.top,
            Some(n) if n < 0 => {
                return Err(AppError::invalid_field(
                    "top",
                    "range",
                    format!("top must not be negative, got {}", n),
                ));
            }
            Some(n) => usize::try_from(n).unwrap_or(usize::MAX),
        };

        let min_score = min_score.unwrap_or(defaults.min_score);
        if min_score < Decimal::ZERO || min_score > Decimal::ONE_HUNDRED {
            return Err(AppError::invalid_field(
                "min_score",
                "range",
                format!("min_score must be between 0 and 100, got {}", min_score),
            ));
        }

        Ok(Self { top, min_score })
    }
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            top: 5,
            min_score: Decimal::from(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub invoice: Invoice,
    pub transaction: BankTransaction,
    pub score: ScoreResult,
}

#[derive(Debug, Clone)]
pub struct Ranking {
    /// Pairs at or above the threshold, before truncation to `top`.
    pub total: usize,
    pub candidates: Vec<Candidate>,
}

/// Scores every pair, drops those under `options.min_score` and orders the
/// rest by score descending, then earliest posting, then invoice id, then
/// transaction id.
pub fn rank(
    invoices: &[Invoice],
    transactions: &[BankTransaction],
    vendor_names: &HashMap<Uuid, String>,
    options: RankingOptions,
) -> Ranking {
    let mut scored: Vec<(usize, usize, ScoreResult)> = Vec::new();

    for (i, invoice) in invoices.iter().enumerate() {
        let vendor_name = invoice
            .vendor_id
            .and_then(|id| vendor_names.get(&id))
            .map(String::as_str);

        for (t, transaction) in transactions.iter().enumerate() {
            let result = scoring::score(invoice, transaction, vendor_name);
            if result.score >= options.min_score {
                scored.push((i, t, result));
            }
        }
    }

    scored.sort_by(|(ia, ta, a), (ib, tb, b)| {
        b.score
            .cmp(&a.score)
            .then_with(|| transactions[*ta].posted_utc.cmp(&transactions[*tb].posted_utc))
            .then_with(|| invoices[*ia].invoice_id.cmp(&invoices[*ib].invoice_id))
            .then_with(|| {
                transactions[*ta]
                    .transaction_id
                    .cmp(&transactions[*tb].transaction_id)
            })
    });

    let total = scored.len();
    let candidates = scored
        .into_iter()
        .take(options.top)
        .map(|(i, t, score)| Candidate {
            invoice: invoices[i].clone(),
            transaction: transactions[t].clone(),
            score,
        })
        .collect();

    Ranking { total, candidates }
}
