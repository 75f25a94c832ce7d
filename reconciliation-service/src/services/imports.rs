//! Bulk import of bank transactions and invoices.

use crate::dtos::{
    ImportInvoicesResponse, ImportTransactionsResponse, InvoiceImportItem, TransactionImportItem,
};
use crate::models::{BankTransaction, Invoice, InvoiceStatus};
use crate::services::engine::ReconciliationEngine;
use crate::services::metrics::record_import;
use crate::services::store::{finish, UnitOfWork};
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use std::collections::HashSet;
use tracing::{info, instrument};
use uuid::Uuid;

const AMOUNT_SCALE: u32 = 4;
const AMOUNT_INTEGER_DIGITS: u32 = 15;

impl ReconciliationEngine {
    pub async fn import_transactions(
        &self,
        tenant_id: Uuid,
        items: Vec<TransactionImportItem>,
    ) -> Result<ImportTransactionsResponse, AppError> {
        let mut uow = self.store().begin().await?;
        let result = self
            .import_transactions_in(uow.as_mut(), tenant_id, items)
            .await;
        finish(uow, result).await
    }

    /// Inserts the batch as one unit. Any invalid item or already-imported
    /// external id rejects the whole batch.
    #[instrument(skip(self, uow, items), fields(tenant_id = %tenant_id, count = items.len()))]
    pub async fn import_transactions_in(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        mut items: Vec<TransactionImportItem>,
    ) -> Result<ImportTransactionsResponse, AppError> {
        if items.is_empty() {
            return Err(AppError::invalid_field(
                "transactions",
                "length",
                "At least one transaction is required".to_string(),
            ));
        }

        for item in items.iter_mut() {
            item.external_id = non_blank(item.external_id.take());
        }

        let external_ids = unique_references(
            items.iter().filter_map(|i| i.external_id.as_deref()),
            "external_id",
        )?;

        for (index, item) in items.iter().enumerate() {
            validate_currency(&item.currency, index)?;
            validate_amount(item.amount, index)?;
            if item.amount.is_zero() {
                return Err(AppError::invalid_field(
                    "amount",
                    "range",
                    format!("Item {}: amount must not be zero", index),
                ));
            }
        }

        if !external_ids.is_empty() {
            let existing = uow
                .find_transaction_external_ids(tenant_id, &external_ids)
                .await?;
            if !existing.is_empty() {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Transactions already imported: {}",
                    existing.join(", ")
                )));
            }
        }

        let now = Utc::now();
        let mut transactions = Vec::with_capacity(items.len());
        for item in items {
            let transaction = BankTransaction {
                transaction_id: Uuid::new_v4(),
                tenant_id,
                external_id: item.external_id,
                posted_utc: item.posted_utc,
                amount: item.amount,
                currency: item.currency.to_ascii_uppercase(),
                description: item.description,
                created_utc: now,
            };
            uow.insert_transaction(&transaction).await?;
            transactions.push(transaction);
        }

        record_import("bank_transactions", transactions.len());
        info!(imported = transactions.len(), "Bank transactions imported");

        Ok(ImportTransactionsResponse {
            imported_count: transactions.len(),
            transactions,
        })
    }

    pub async fn import_invoices(
        &self,
        tenant_id: Uuid,
        items: Vec<InvoiceImportItem>,
    ) -> Result<ImportInvoicesResponse, AppError> {
        let mut uow = self.store().begin().await?;
        let result = self.import_invoices_in(uow.as_mut(), tenant_id, items).await;
        finish(uow, result).await
    }

    /// Inserts the batch as one unit. Vendors named by the items are looked
    /// up by name within the tenant and created when missing.
    #[instrument(skip(self, uow, items), fields(tenant_id = %tenant_id, count = items.len()))]
    pub async fn import_invoices_in(
        &self,
        uow: &mut dyn UnitOfWork,
        tenant_id: Uuid,
        mut items: Vec<InvoiceImportItem>,
    ) -> Result<ImportInvoicesResponse, AppError> {
        if items.is_empty() {
            return Err(AppError::invalid_field(
                "invoices",
                "length",
                "At least one invoice is required".to_string(),
            ));
        }

        for item in items.iter_mut() {
            item.invoice_number = non_blank(item.invoice_number.take());
        }

        let numbers = unique_references(
            items.iter().filter_map(|i| i.invoice_number.as_deref()),
            "invoice_number",
        )?;

        for (index, item) in items.iter().enumerate() {
            validate_currency(&item.currency, index)?;
            validate_amount(item.amount, index)?;
            if item.amount <= Decimal::ZERO {
                return Err(AppError::invalid_field(
                    "amount",
                    "range",
                    format!("Item {}: amount must be positive", index),
                ));
            }
            if let (Some(issued), Some(due)) = (item.invoice_date, item.due_date) {
                if due < issued {
                    return Err(AppError::invalid_field(
                        "due_date",
                        "range",
                        format!("Item {}: due_date must not precede invoice_date", index),
                    ));
                }
            }
        }

        if !numbers.is_empty() {
            let existing = uow.find_invoice_numbers(tenant_id, &numbers).await?;
            if !existing.is_empty() {
                return Err(AppError::Conflict(anyhow::anyhow!(
                    "Invoice numbers already exist: {}",
                    existing.join(", ")
                )));
            }
        }

        let now = Utc::now();
        let mut invoices = Vec::with_capacity(items.len());
        for item in items {
            let vendor_id = match item.vendor_name.as_deref().map(str::trim) {
                Some(name) if !name.is_empty() => {
                    Some(uow.find_or_create_vendor(tenant_id, name, now).await?.vendor_id)
                }
                _ => None,
            };

            let invoice = Invoice {
                invoice_id: Uuid::new_v4(),
                tenant_id,
                vendor_id,
                invoice_number: item.invoice_number,
                amount: item.amount,
                currency: item.currency.to_ascii_uppercase(),
                invoice_date: item.invoice_date,
                due_date: item.due_date,
                description: item.description,
                status: InvoiceStatus::Open,
                matched_transaction_id: None,
                created_utc: now,
                updated_utc: now,
            };
            uow.insert_invoice(&invoice).await?;
            invoices.push(invoice);
        }

        record_import("invoices", invoices.len());
        info!(imported = invoices.len(), "Invoices imported");

        Ok(ImportInvoicesResponse {
            imported_count: invoices.len(),
            invoices,
        })
    }
}

/// Collects the non-empty references of a batch, rejecting repeats.
fn unique_references<'a>(
    references: impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<Vec<String>, AppError> {
    let mut seen = HashSet::new();
    let mut duplicates = Vec::new();
    for reference in references.filter(|r| !r.is_empty()) {
        if !seen.insert(reference) && !duplicates.contains(&reference) {
            duplicates.push(reference);
        }
    }

    if !duplicates.is_empty() {
        return Err(AppError::invalid_field(
            field,
            "unique",
            format!("Duplicate {} values in batch: {}", field, duplicates.join(", ")),
        ));
    }

    let mut unique: Vec<String> = seen.into_iter().map(str::to_string).collect();
    unique.sort();
    Ok(unique)
}

/// Trims a client reference; blank references are stored as absent.
fn non_blank(reference: Option<String>) -> Option<String> {
    reference
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
}

/// Amounts are stored as NUMERIC(19, 4).
fn validate_amount(amount: Decimal, index: usize) -> Result<(), AppError> {
    if amount.normalize().scale() > AMOUNT_SCALE {
        return Err(AppError::invalid_field(
            "amount",
            "range",
            format!(
                "Item {}: amount {} has more than {} decimal places",
                index, amount, AMOUNT_SCALE
            ),
        ));
    }
    if amount.abs() >= max_amount_magnitude() {
        return Err(AppError::invalid_field(
            "amount",
            "range",
            format!("Item {}: amount {} is out of range", index, amount),
        ));
    }
    Ok(())
}

fn max_amount_magnitude() -> Decimal {
    Decimal::from(10_i64.pow(AMOUNT_INTEGER_DIGITS))
}

fn validate_currency(currency: &str, index: usize) -> Result<(), AppError> {
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(AppError::invalid_field(
            "currency",
            "format",
            format!("Item {}: currency must be a 3-letter code, got '{}'", index, currency),
        ));
    }
    Ok(())
}
