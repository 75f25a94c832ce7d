//! Configuration module for reconciliation-service.

use rust_decimal::Decimal;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub idempotency: IdempotencyConfig,
    pub ranking: RankingConfig,
    pub explanation: ExplanationConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl_hours: i64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    pub default_top: usize,
    pub default_min_score: Decimal,
}

#[derive(Clone)]
pub struct ExplanationConfig {
    pub enabled: bool,
    pub endpoint: Option<String>,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout_ms: u64,
    pub max_retries: u32,
}

impl std::fmt::Debug for ExplanationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExplanationConfig")
            .field("enabled", &self.enabled)
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("model", &self.model)
            .field("timeout_ms", &self.timeout_ms)
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, AppError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|_| {
            AppError::ConfigError(anyhow::anyhow!("{} has an invalid value '{}'", name, raw))
        }),
        _ => Ok(default),
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let ranking = RankingConfig {
            default_top: parse_or("RECONCILE_DEFAULT_TOP", 5)?,
            default_min_score: parse_or("RECONCILE_DEFAULT_MIN_SCORE", Decimal::from(60))?,
        };
        if ranking.default_min_score < Decimal::ZERO
            || ranking.default_min_score > Decimal::ONE_HUNDRED
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECONCILE_DEFAULT_MIN_SCORE must be between 0 and 100"
            )));
        }

        let explanation = ExplanationConfig {
            enabled: parse_or("EXPLANATION_ENABLED", false)?,
            endpoint: non_empty("EXPLANATION_ENDPOINT"),
            api_key: non_empty("EXPLANATION_API_KEY"),
            model: non_empty("EXPLANATION_MODEL"),
            timeout_ms: parse_or("EXPLANATION_TIMEOUT_MS", 10_000)?,
            max_retries: parse_or("EXPLANATION_MAX_RETRIES", 2)?,
        };
        if explanation.enabled && explanation.endpoint.is_none() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "EXPLANATION_ENDPOINT is required when EXPLANATION_ENABLED is true"
            )));
        }

        let idempotency = IdempotencyConfig {
            ttl_hours: parse_or("IDEMPOTENCY_TTL_HOURS", 48)?,
            cleanup_interval_secs: parse_or("IDEMPOTENCY_CLEANUP_INTERVAL_SECS", 3600)?,
        };
        if idempotency.ttl_hours <= 0 || idempotency.cleanup_interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IDEMPOTENCY_TTL_HOURS and IDEMPOTENCY_CLEANUP_INTERVAL_SECS must be positive"
            )));
        }

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: non_empty("OTLP_ENDPOINT"),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            idempotency,
            ranking,
            explanation,
        })
    }
}
