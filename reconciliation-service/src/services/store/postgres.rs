//! Postgres-backed store.

use super::{Store, UnitOfWork};
use crate::models::{BankTransaction, IdempotencyRecord, Invoice, Match, MatchStatus, Vendor};
use crate::services::metrics::DB_QUERY_DURATION;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const INVOICE_COLUMNS: &str = "invoice_id, tenant_id, vendor_id, invoice_number, amount, currency, \
     invoice_date, due_date, description, status, matched_transaction_id, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str =
    "transaction_id, tenant_id, external_id, posted_utc, amount, currency, description, created_utc";

const MATCH_COLUMNS: &str = "match_id, tenant_id, invoice_id, transaction_id, score, status, \
     reason, confirmed_utc, created_utc";

fn db_error(action: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

/// Connection pool wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[instrument(skip(database_url), fields(service = "reconciliation-service"))]
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, AppError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self))]
    async fn purge_expired_idempotency_records(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["purge_idempotency_records"])
            .start_timer();

        let result = sqlx::query("DELETE FROM idempotency_records WHERE expires_utc <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("purge idempotency records", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }
}

/// One Postgres transaction. Dropped without commit, sqlx rolls it back.
pub struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    // =========================================================================
    // Vendor Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn vendor_names(&mut self, tenant_id: Uuid) -> Result<HashMap<Uuid, String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["vendor_names"])
            .start_timer();

        let rows = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT vendor_id, name FROM vendors WHERE tenant_id = $1",
        )
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("list vendors", e))?;

        timer.observe_duration();
        Ok(rows.into_iter().collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn find_or_create_vendor(
        &mut self,
        tenant_id: Uuid,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Vendor, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_or_create_vendor"])
            .start_timer();

        // The no-op update makes RETURNING yield the existing row on conflict.
        let vendor = sqlx::query_as::<_, Vendor>(
            r#"
            INSERT INTO vendors (vendor_id, tenant_id, name, created_utc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, name) DO UPDATE SET name = EXCLUDED.name
            RETURNING vendor_id, tenant_id, name, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(name)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| db_error("find or create vendor", e))?;

        timer.observe_duration();
        Ok(vendor)
    }

    // =========================================================================
    // Invoice Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_open_invoices(&mut self, tenant_id: Uuid) -> Result<Vec<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_open_invoices"])
            .start_timer();

        let invoices = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND status = 'open' ORDER BY invoice_id",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("list open invoices", e))?;

        timer.observe_duration();
        Ok(invoices)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("get invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn lock_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
    ) -> Result<Option<Invoice>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_invoice"])
            .start_timer();

        let invoice = sqlx::query_as::<_, Invoice>(&format!(
            "SELECT {} FROM invoices WHERE tenant_id = $1 AND invoice_id = $2 FOR UPDATE",
            INVOICE_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("lock invoice", e))?;

        timer.observe_duration();
        Ok(invoice)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn mark_invoice_matched(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        transaction_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["mark_invoice_matched"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE invoices
            SET status = 'matched', matched_transaction_id = $3, updated_utc = $4
            WHERE tenant_id = $1 AND invoice_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(transaction_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("mark invoice matched", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Invoice {} not found",
                invoice_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self, numbers), fields(tenant_id = %tenant_id, count = numbers.len()))]
    async fn find_invoice_numbers(
        &mut self,
        tenant_id: Uuid,
        numbers: &[String],
    ) -> Result<Vec<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_invoice_numbers"])
            .start_timer();

        let existing = sqlx::query_scalar::<_, String>(
            "SELECT invoice_number FROM invoices WHERE tenant_id = $1 AND invoice_number = ANY($2)",
        )
        .bind(tenant_id)
        .bind(numbers)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("look up invoice numbers", e))?;

        timer.observe_duration();
        Ok(existing)
    }

    #[instrument(skip(self, invoice), fields(tenant_id = %invoice.tenant_id, invoice_id = %invoice.invoice_id))]
    async fn insert_invoice(&mut self, invoice: &Invoice) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_invoice"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO invoices (invoice_id, tenant_id, vendor_id, invoice_number, amount, currency,
                                  invoice_date, due_date, description, status, matched_transaction_id,
                                  created_utc, updated_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(invoice.invoice_id)
        .bind(invoice.tenant_id)
        .bind(invoice.vendor_id)
        .bind(&invoice.invoice_number)
        .bind(invoice.amount)
        .bind(&invoice.currency)
        .bind(invoice.invoice_date)
        .bind(invoice.due_date)
        .bind(&invoice.description)
        .bind(invoice.status.as_str())
        .bind(invoice.matched_transaction_id)
        .bind(invoice.created_utc)
        .bind(invoice.updated_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice number '{}' already exists for tenant",
                    invoice.invoice_number.as_deref().unwrap_or_default()
                ))
            }
            _ => db_error("create invoice", e),
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Bank Transaction Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_unmatched_transactions(
        &mut self,
        tenant_id: Uuid,
    ) -> Result<Vec<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unmatched_transactions"])
            .start_timer();

        let transactions = sqlx::query_as::<_, BankTransaction>(&format!(
            r#"
            SELECT {} FROM bank_transactions t
            WHERE t.tenant_id = $1
              AND NOT EXISTS (
                  SELECT 1 FROM matches m
                  WHERE m.transaction_id = t.transaction_id AND m.status = 'confirmed'
              )
            ORDER BY t.posted_utc, t.transaction_id
            "#,
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("list unmatched transactions", e))?;

        timer.observe_duration();
        Ok(transactions)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<BankTransaction>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_transaction"])
            .start_timer();

        let transaction = sqlx::query_as::<_, BankTransaction>(&format!(
            "SELECT {} FROM bank_transactions WHERE tenant_id = $1 AND transaction_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("get bank transaction", e))?;

        timer.observe_duration();
        Ok(transaction)
    }

    #[instrument(skip(self, external_ids), fields(tenant_id = %tenant_id, count = external_ids.len()))]
    async fn find_transaction_external_ids(
        &mut self,
        tenant_id: Uuid,
        external_ids: &[String],
    ) -> Result<Vec<String>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_transaction_external_ids"])
            .start_timer();

        let existing = sqlx::query_scalar::<_, String>(
            "SELECT external_id FROM bank_transactions WHERE tenant_id = $1 AND external_id = ANY($2)",
        )
        .bind(tenant_id)
        .bind(external_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("look up transaction external ids", e))?;

        timer.observe_duration();
        Ok(existing)
    }

    #[instrument(skip(self, transaction), fields(tenant_id = %transaction.tenant_id, transaction_id = %transaction.transaction_id))]
    async fn insert_transaction(&mut self, transaction: &BankTransaction) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_transaction"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO bank_transactions (transaction_id, tenant_id, external_id, posted_utc,
                                           amount, currency, description, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(transaction.transaction_id)
        .bind(transaction.tenant_id)
        .bind(&transaction.external_id)
        .bind(transaction.posted_utc)
        .bind(transaction.amount)
        .bind(&transaction.currency)
        .bind(&transaction.description)
        .bind(transaction.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Transaction with external_id '{}' already exists",
                    transaction.external_id.as_deref().unwrap_or_default()
                ))
            }
            _ => db_error("create bank transaction", e),
        })?;

        timer.observe_duration();
        Ok(())
    }

    // =========================================================================
    // Match Operations
    // =========================================================================

    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, match_id = %record.match_id))]
    async fn insert_match(&mut self, record: &Match) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_match"])
            .start_timer();

        sqlx::query(
            r#"
            INSERT INTO matches (match_id, tenant_id, invoice_id, transaction_id, score, status,
                                 reason, confirmed_utc, created_utc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.match_id)
        .bind(record.tenant_id)
        .bind(record.invoice_id)
        .bind(record.transaction_id)
        .bind(record.score)
        .bind(record.status.as_str())
        .bind(&record.reason)
        .bind(record.confirmed_utc)
        .bind(record.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("create match", e))?;

        timer.observe_duration();
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn get_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_match"])
            .start_timer();

        let record = sqlx::query_as::<_, Match>(&format!(
            "SELECT {} FROM matches WHERE tenant_id = $1 AND match_id = $2",
            MATCH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(match_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("get match", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_matches_for_invoice(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_matches_for_invoice"])
            .start_timer();

        let records = sqlx::query_as::<_, Match>(&format!(
            r#"
            SELECT {} FROM matches
            WHERE tenant_id = $1 AND invoice_id = $2 AND ($3::text IS NULL OR status = $3)
            ORDER BY created_utc, match_id
            "#,
            MATCH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("list matches for invoice", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn list_matches_by_status(
        &mut self,
        tenant_id: Uuid,
        status: Option<MatchStatus>,
    ) -> Result<Vec<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_matches_by_status"])
            .start_timer();

        let records = sqlx::query_as::<_, Match>(&format!(
            r#"
            SELECT {} FROM matches
            WHERE tenant_id = $1 AND ($2::text IS NULL OR status = $2)
            ORDER BY score DESC, created_utc, match_id
            "#,
            MATCH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| db_error("list matches", e))?;

        timer.observe_duration();
        Ok(records)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn confirmed_match_for_transaction(
        &mut self,
        tenant_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<Match>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirmed_match_for_transaction"])
            .start_timer();

        let record = sqlx::query_as::<_, Match>(&format!(
            r#"
            SELECT {} FROM matches
            WHERE tenant_id = $1 AND transaction_id = $2 AND status = 'confirmed'
            "#,
            MATCH_COLUMNS
        ))
        .bind(tenant_id)
        .bind(transaction_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("look up confirmed match", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn confirm_match(
        &mut self,
        tenant_id: Uuid,
        match_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["confirm_match"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE matches SET status = 'confirmed', confirmed_utc = $3
            WHERE tenant_id = $1 AND match_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(match_id)
        .bind(now)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                AppError::Conflict(anyhow::anyhow!(
                    "Invoice or transaction of match {} is already confirmed",
                    match_id
                ))
            }
            _ => db_error("confirm match", e),
        })?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Match {} not found",
                match_id
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn reject_competing_matches(
        &mut self,
        tenant_id: Uuid,
        invoice_id: Uuid,
        keep_match_id: Uuid,
    ) -> Result<u64, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["reject_competing_matches"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE matches SET status = 'rejected'
            WHERE tenant_id = $1 AND invoice_id = $2 AND match_id <> $3 AND status = 'proposed'
            "#,
        )
        .bind(tenant_id)
        .bind(invoice_id)
        .bind(keep_match_id)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("reject competing matches", e))?;

        timer.observe_duration();
        Ok(result.rows_affected())
    }

    // =========================================================================
    // Idempotency Operations
    // =========================================================================

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn find_idempotency_record(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<IdempotencyRecord>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_idempotency_record"])
            .start_timer();

        let record = sqlx::query_as::<_, IdempotencyRecord>(
            r#"
            SELECT idempotency_key, tenant_id, operation, request_hash, response_status,
                   response_body, created_utc, expires_utc
            FROM idempotency_records
            WHERE idempotency_key = $1 AND tenant_id = $2 AND operation = $3 AND expires_utc > $4
            "#,
        )
        .bind(key)
        .bind(tenant_id)
        .bind(operation)
        .bind(now)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| db_error("read idempotency record", e))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self, record), fields(tenant_id = %record.tenant_id, operation = %record.operation))]
    async fn claim_idempotency_key(
        &mut self,
        record: &IdempotencyRecord,
    ) -> Result<bool, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["claim_idempotency_key"])
            .start_timer();

        sqlx::query(
            r#"
            DELETE FROM idempotency_records
            WHERE idempotency_key = $1 AND tenant_id = $2 AND operation = $3 AND expires_utc <= $4
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(record.tenant_id)
        .bind(&record.operation)
        .bind(record.created_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("clear expired idempotency record", e))?;

        // Blocks on a concurrent uncommitted insert of the same tuple until
        // that transaction ends.
        let result = sqlx::query(
            r#"
            INSERT INTO idempotency_records (idempotency_key, tenant_id, operation, request_hash,
                                             created_utc, expires_utc)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (idempotency_key, tenant_id, operation) DO NOTHING
            "#,
        )
        .bind(&record.idempotency_key)
        .bind(record.tenant_id)
        .bind(&record.operation)
        .bind(&record.request_hash)
        .bind(record.created_utc)
        .bind(record.expires_utc)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("claim idempotency key", e))?;

        timer.observe_duration();
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, body), fields(tenant_id = %tenant_id))]
    async fn store_idempotent_response(
        &mut self,
        tenant_id: Uuid,
        key: &str,
        operation: &str,
        status: i32,
        body: &str,
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["store_idempotent_response"])
            .start_timer();

        let result = sqlx::query(
            r#"
            UPDATE idempotency_records SET response_status = $4, response_body = $5
            WHERE idempotency_key = $1 AND tenant_id = $2 AND operation = $3
            "#,
        )
        .bind(key)
        .bind(tenant_id)
        .bind(operation)
        .bind(status)
        .bind(body)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| db_error("store idempotent response", e))?;

        timer.observe_duration();

        if result.rows_affected() == 0 {
            return Err(AppError::InternalError(anyhow::anyhow!(
                "Idempotency record for operation '{}' vanished before response was stored",
                operation
            )));
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .commit()
            .await
            .map_err(|e| db_error("commit transaction", e))
    }

    async fn rollback(self: Box<Self>) -> Result<(), AppError> {
        self.tx
            .rollback()
            .await
            .map_err(|e| db_error("roll back transaction", e))
    }
}
