//! Common test utilities for reconciliation-service integration tests.

#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use reconciliation_service::models::{BankTransaction, Invoice, InvoiceStatus, Vendor};
use reconciliation_service::services::explanation::ExplanationService;
use reconciliation_service::services::ranking::RankingOptions;
use reconciliation_service::services::store::{MemoryStore, Store};
use reconciliation_service::startup::AppState;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::{Arc, Once};
use uuid::Uuid;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,reconciliation_service=debug,sqlx=warn")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// In-memory application with its own store and a fresh tenant.
pub struct TestApp {
    pub store: MemoryStore,
    pub state: AppState,
    pub tenant_id: Uuid,
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(ExplanationService::disabled())
}

pub fn spawn_app_with(explanations: ExplanationService) -> TestApp {
    init_tracing();

    let store = MemoryStore::new();
    let shared: Arc<dyn Store> = Arc::new(store.clone());
    let state = AppState::new(
        shared,
        RankingOptions::default(),
        explanations,
        chrono::Duration::hours(48),
    );

    TestApp {
        store,
        state,
        tenant_id: Uuid::new_v4(),
    }
}

pub fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).unwrap()
}

pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

pub fn invoice(tenant_id: Uuid, number: &str, amount: &str, invoice_date: NaiveDate) -> Invoice {
    let now = Utc::now();
    Invoice {
        invoice_id: Uuid::new_v4(),
        tenant_id,
        vendor_id: None,
        invoice_number: Some(number.to_string()),
        amount: dec(amount),
        currency: "USD".to_string(),
        invoice_date: Some(invoice_date),
        due_date: None,
        description: None,
        status: InvoiceStatus::Open,
        matched_transaction_id: None,
        created_utc: now,
        updated_utc: now,
    }
}

pub fn transaction(
    tenant_id: Uuid,
    external_id: Option<&str>,
    amount: &str,
    posted_utc: DateTime<Utc>,
    description: &str,
) -> BankTransaction {
    BankTransaction {
        transaction_id: Uuid::new_v4(),
        tenant_id,
        external_id: external_id.map(str::to_string),
        posted_utc,
        amount: dec(amount),
        currency: "USD".to_string(),
        description: Some(description.to_string()),
        created_utc: Utc::now(),
    }
}

impl TestApp {
    pub async fn seed_invoice(&self, invoice: Invoice) -> Invoice {
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_invoice(&invoice).await.unwrap();
        uow.commit().await.unwrap();
        invoice
    }

    pub async fn seed_transaction(&self, transaction: BankTransaction) -> BankTransaction {
        let mut uow = self.store.begin().await.unwrap();
        uow.insert_transaction(&transaction).await.unwrap();
        uow.commit().await.unwrap();
        transaction
    }

    pub async fn seed_vendor(&self, tenant_id: Uuid, name: &str) -> Vendor {
        let mut uow = self.store.begin().await.unwrap();
        let vendor = uow
            .find_or_create_vendor(tenant_id, name, Utc::now())
            .await
            .unwrap();
        uow.commit().await.unwrap();
        vendor
    }

    pub async fn invoice(&self, invoice_id: Uuid) -> Invoice {
        let mut uow = self.store.begin().await.unwrap();
        let invoice = uow
            .get_invoice(self.tenant_id, invoice_id)
            .await
            .unwrap()
            .expect("invoice should exist");
        uow.rollback().await.unwrap();
        invoice
    }

    /// One open invoice and two same-amount transactions: an exact reference
    /// hit (score 100) and a description hit (score 95).
    pub async fn seed_competing_pair(&self) -> (Invoice, BankTransaction, BankTransaction) {
        let invoice = self
            .seed_invoice(invoice(self.tenant_id, "INV-100", "250.00", date(2026, 1, 1)))
            .await;
        let exact = self
            .seed_transaction(transaction(
                self.tenant_id,
                Some("INV-100"),
                "250.00",
                at(2026, 1, 3),
                "wire",
            ))
            .await;
        let described = self
            .seed_transaction(transaction(
                self.tenant_id,
                None,
                "250.00",
                at(2026, 1, 2),
                "payment INV-100",
            ))
            .await;
        (invoice, exact, described)
    }
}
