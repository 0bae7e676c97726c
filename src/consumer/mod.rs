//! Tenant consumption pipeline
//!
//! A [`TenantManager`] owns the registry of tenants. Each tenant is a
//! [`TenantConsumer`]: one logical broker channel plus a bounded pool of
//! worker tasks draining the tenant's queue through a [`MessageHandler`].

pub mod handler;
pub mod manager;
pub mod tenant;
mod worker;

use crate::error::{CarrierError, Result};

pub use handler::{LogHandler, MessageHandler};
pub use manager::{TenantManager, TenantSnapshot};
pub use tenant::{LifecycleState, TenantConsumer};

/// Smallest allowed worker pool
pub const MIN_WORKERS: usize = 1;
/// Largest allowed worker pool
pub const MAX_WORKERS: usize = 10;

/// Validate a requested worker count against the allowed bounds
pub fn validate_worker_count(count: usize) -> Result<()> {
    if !(MIN_WORKERS..=MAX_WORKERS).contains(&count) {
        return Err(CarrierError::InvalidConfig(format!(
            "worker count must be between {} and {}, got {}",
            MIN_WORKERS, MAX_WORKERS, count
        )));
    }
    Ok(())
}

/// Validate a tenant identifier. It becomes part of queue names and routing
/// keys, so the character set is restricted.
pub fn validate_tenant_id(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() {
        return Err(CarrierError::InvalidConfig(
            "tenant id must not be empty".to_string(),
        ));
    }
    if tenant_id.len() > 64 {
        return Err(CarrierError::InvalidConfig(
            "tenant id must be at most 64 characters".to_string(),
        ));
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(CarrierError::InvalidConfig(format!(
            "tenant id '{}' contains invalid characters",
            tenant_id
        )));
    }
    Ok(())
}
