//! Services module for reconciliation-service.

pub mod engine;
pub mod explanation;
pub mod idempotency;
pub mod imports;
pub mod metrics;
pub mod ranking;
pub mod scoring;
pub mod store;

pub use engine::{ReconciliationEngine, ReconciliationResult};
pub use explanation::{
    Explanation, ExplanationProvider, ExplanationService, ExplanationSource,
    HttpExplanationProvider,
};
pub use idempotency::{GuardedResponse, IdempotencyGuard, IdempotentRequest, IdempotentResponse};
pub use metrics::{get_metrics, init_metrics};
pub use ranking::RankingOptions;
pub use store::{MemoryStore, PgStore, Store, UnitOfWork};
