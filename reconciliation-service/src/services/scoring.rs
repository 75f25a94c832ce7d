//! Heuristic invoice/transaction scoring.
//!
//! Rules are evaluated in a fixed order. An exact identifier match
//! short-circuits to 100; an amount mismatch short-circuits to 0; otherwise
//! weighted signals accumulate and the total is clamped to `[0, 100]`.

use crate::models::{BankTransaction, Invoice};
use rust_decimal::Decimal;

const IDENTIFIER_SCORE: i64 = 100;
const AMOUNT_WEIGHT: i64 = 50;
const DATE_NEAR_WEIGHT: i64 = 20;
const DATE_WEEK_WEIGHT: i64 = 10;
const INVOICE_NUMBER_WEIGHT: i64 = 25;
const VENDOR_NAME_WEIGHT: i64 = 15;
const CURRENCY_PENALTY: i64 = 50;

const DATE_NEAR_DAYS: i64 = 3;
const DATE_WEEK_DAYS: i64 = 7;

pub const REASON_IDENTIFIER: &str = "identifier match (invoice number equals transaction reference)";
pub const REASON_AMOUNT_MISMATCH: &str = "amount mismatch";
pub const REASON_AMOUNT_MATCH: &str = "amount match";
pub const REASON_DATE_NEAR: &str = "date within 3 days";
pub const REASON_DATE_WEEK: &str = "date within 7 days";
pub const REASON_INVOICE_NUMBER: &str = "invoice number in description";
pub const REASON_VENDOR_NAME: &str = "vendor name in description";
pub const REASON_CURRENCY_MISMATCH: &str = "currency mismatch";

/// Score with two-decimal precision plus the rules that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoreResult {
    pub score: Decimal,
    pub reason: String,
}

impl ScoreResult {
    fn new(points: i64, reason: String) -> Self {
        let mut score = Decimal::from(points.clamp(0, 100));
        score.rescale(2);
        Self { score, reason }
    }
}

/// Scores one invoice against one transaction. `vendor_name` is the
/// invoice vendor's display name when it could be resolved.
pub fn score(
    invoice: &Invoice,
    transaction: &BankTransaction,
    vendor_name: Option<&str>,
) -> ScoreResult {
    let invoice_number = present(invoice.invoice_number.as_deref());

    if let (Some(number), Some(reference)) =
        (invoice_number, present(transaction.external_id.as_deref()))
    {
        if number == reference {
            return ScoreResult::new(IDENTIFIER_SCORE, REASON_IDENTIFIER.to_string());
        }
    }

    if invoice.amount != transaction.amount {
        return ScoreResult::new(0, REASON_AMOUNT_MISMATCH.to_string());
    }

    let mut points = AMOUNT_WEIGHT;
    let mut reasons = vec![REASON_AMOUNT_MATCH];

    if let Some(invoice_date) = invoice.invoice_date {
        let days = (transaction.posted_utc.date_naive() - invoice_date)
            .num_days()
            .abs();
        if days <= DATE_NEAR_DAYS {
            points += DATE_NEAR_WEIGHT;
            reasons.push(REASON_DATE_NEAR);
        } else if days <= DATE_WEEK_DAYS {
            points += DATE_WEEK_WEIGHT;
            reasons.push(REASON_DATE_WEEK);
        }
    }

    if let Some(description) = transaction.description.as_deref() {
        if let Some(number) = invoice_number {
            if description.contains(number) {
                points += INVOICE_NUMBER_WEIGHT;
                reasons.push(REASON_INVOICE_NUMBER);
            }
        }

        if let Some(vendor) = vendor_name.map(str::trim).filter(|v| !v.is_empty()) {
            if description.to_lowercase().contains(&vendor.to_lowercase()) {
                points += VENDOR_NAME_WEIGHT;
                reasons.push(REASON_VENDOR_NAME);
            }
        }
    }

    if invoice.currency != transaction.currency {
        points -= CURRENCY_PENALTY;
        reasons.push(REASON_CURRENCY_MISMATCH);
    }

    ScoreResult::new(points, reasons.join("; "))
}

/// Blank identifiers count as absent.
fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}
