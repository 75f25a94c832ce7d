//! HTTP handlers for reconciliation-service.

pub mod health;
pub mod imports;
pub mod reconciliation;
