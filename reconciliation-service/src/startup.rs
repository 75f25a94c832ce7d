//! Application startup and lifecycle management.

use crate::config::ReconciliationConfig;
use crate::handlers;
use crate::services::explanation::{
    ExplanationProvider, ExplanationService, HttpExplanationProvider,
};
use crate::services::idempotency::IdempotencyGuard;
use crate::services::ranking::RankingOptions;
use crate::services::store::{PgStore, Store};
use crate::services::ReconciliationEngine;
use axum::middleware::from_fn;
use axum::{
    routing::{get, post},
    Router,
};
use service_core::error::AppError;
use service_core::middleware::{
    metrics::metrics_middleware,
    tracing::{request_id_middleware, REQUEST_ID_HEADER},
};
use service_core::retry::RetryConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub engine: ReconciliationEngine,
    pub guard: IdempotencyGuard,
    pub store: Arc<dyn Store>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn Store>,
        defaults: RankingOptions,
        explanations: ExplanationService,
        idempotency_ttl: chrono::Duration,
    ) -> Self {
        Self {
            engine: ReconciliationEngine::new(store.clone(), defaults, explanations),
            guard: IdempotencyGuard::new(store.clone(), idempotency_ttl),
            store,
        }
    }
}

/// Builds the HTTP router over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::health::metrics_endpoint))
        .route(
            "/api/v1/reconcile",
            post(handlers::reconciliation::reconcile),
        )
        .route(
            "/api/v1/matches",
            get(handlers::reconciliation::list_matches),
        )
        .route(
            "/api/v1/matches/:match_id/confirm",
            post(handlers::reconciliation::confirm_match),
        )
        .route(
            "/api/v1/matches/:match_id/explain",
            get(handlers::reconciliation::explain_match),
        )
        .route(
            "/api/v1/bank-transactions/import",
            post(handlers::imports::import_transactions),
        )
        .route(
            "/api/v1/invoices/import",
            post(handlers::imports::import_invoices),
        )
        .layer(from_fn(metrics_middleware))
        .layer(from_fn(request_id_middleware))
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                    version = ?request.version(),
                )
            }),
        )
        .with_state(state)
}

fn explanation_service(config: &ReconciliationConfig) -> ExplanationService {
    let timeout = Duration::from_millis(config.explanation.timeout_ms);
    let retry = RetryConfig::with_max_retries(config.explanation.max_retries);

    match (&config.explanation.endpoint, config.explanation.enabled) {
        (Some(endpoint), true) => {
            tracing::info!(endpoint = %endpoint, "Explanation provider enabled");
            let provider: Arc<dyn ExplanationProvider> = Arc::new(HttpExplanationProvider::new(
                endpoint.clone(),
                config.explanation.api_key.clone(),
                config.explanation.model.clone(),
            ));
            ExplanationService::new(Some(provider), timeout, retry)
        }
        _ => {
            tracing::info!("Explanation provider disabled, serving heuristic reasons");
            ExplanationService::new(None, timeout, retry)
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
    cleanup_interval: Duration,
}

impl Application {
    /// Connects the store, applies migrations and binds the listener.
    pub async fn build(config: ReconciliationConfig) -> Result<Self, AppError> {
        let store = PgStore::connect(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await?;

        store.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run database migrations");
            e
        })?;
        tracing::info!("Database migrations applied");

        let defaults = RankingOptions {
            top: config.ranking.default_top,
            min_score: config.ranking.default_min_score,
        };
        let state = AppState::new(
            Arc::new(store),
            defaults,
            explanation_service(&config),
            chrono::Duration::hours(config.idempotency.ttl_hours),
        );

        let addr = config.common.bind_address();
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!("Reconciliation service: HTTP on port {}", port);

        Ok(Self {
            port,
            listener,
            state,
            cleanup_interval: Duration::from_secs(config.idempotency.cleanup_interval_secs),
        })
    }

    /// Get the HTTP port the server is listening on.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    /// Serves requests and runs the idempotency cleanup sweep until stopped.
    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        let cleanup = self.state.guard.spawn_cleanup(self.cleanup_interval);
        let app = router(self.state);

        let result = axum::serve(self.listener, app).await;
        cleanup.abort();

        result.map_err(|e| {
            tracing::error!("HTTP server error: {}", e);
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
