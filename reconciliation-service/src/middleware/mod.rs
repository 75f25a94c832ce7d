pub mod tenant;

pub use tenant::{IdempotencyKey, TenantId, TENANT_ID_HEADER};
