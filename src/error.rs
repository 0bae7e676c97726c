//! Error types for Carrier
//!
//! This module defines the main error taxonomy used throughout Carrier and
//! provides the mapping to HTTP status codes used by the administrative API.
//!
//! Caller errors (`AlreadyExists`, `NotFound`, `InvalidConfig`) surface to the
//! administrative layer. `BrokerUnavailable` is transient and retried
//! internally by the connection guardian. `HandlerFailure` is message-level
//! and drives acknowledgment semantics, never an API response.

use thiserror::Error;

/// Result type alias for Carrier operations
pub type Result<T> = std::result::Result<T, CarrierError>;

/// Main error type for Carrier
#[derive(Error, Debug)]
pub enum CarrierError {
    #[error("Tenant already exists: {0}")]
    AlreadyExists(String),

    #[error("Tenant not found: {0}")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Handler failure: {0}")]
    HandlerFailure(String),

    #[error("Resource teardown failure: {0}")]
    ResourceTeardownFailure(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CarrierError {
    /// Create a broker error with operation context
    ///
    /// # Example
    /// ```ignore
    /// CarrierError::broker("queue_declare", "channel closed")
    /// // produces: "Broker error: queue_declare: channel closed"
    /// ```
    pub fn broker(operation: &str, detail: impl Into<String>) -> Self {
        CarrierError::Broker(format!("{}: {}", operation, detail.into()))
    }

    /// Create a configuration error with setting context
    pub fn config(setting: &str, reason: impl Into<String>) -> Self {
        CarrierError::Config(format!("{}: {}", setting, reason.into()))
    }

    /// Create a teardown error with resource context
    pub fn teardown(resource: &str, detail: impl Into<String>) -> Self {
        CarrierError::ResourceTeardownFailure(format!("{}: {}", resource, detail.into()))
    }

    /// Convert this error to the HTTP status code returned by the admin API
    pub fn http_status(&self) -> u16 {
        match self {
            CarrierError::AlreadyExists(_) => 409,
            CarrierError::NotFound(_) => 404,
            CarrierError::InvalidConfig(_) => 400,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_already_exists_display() {
        let err = CarrierError::AlreadyExists("acme".to_string());
        assert_eq!(err.to_string(), "Tenant already exists: acme");
    }

    #[test]
    fn test_not_found_display() {
        let err = CarrierError::NotFound("ghost".to_string());
        assert_eq!(err.to_string(), "Tenant not found: ghost");
    }

    #[test]
    fn test_invalid_config_display() {
        let err = CarrierError::InvalidConfig("worker count must be 1-10".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: worker count must be 1-10"
        );
    }

    #[test]
    fn test_broker_builder() {
        let err = CarrierError::broker("queue_declare", "channel closed");
        assert_eq!(
            err.to_string(),
            "Broker error: queue_declare: channel closed"
        );
    }

    #[test]
    fn test_teardown_builder() {
        let err = CarrierError::teardown("queue tenant_acme_queue", "delete refused");
        assert_eq!(
            err.to_string(),
            "Resource teardown failure: queue tenant_acme_queue: delete refused"
        );
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(CarrierError::AlreadyExists("t".into()).http_status(), 409);
        assert_eq!(CarrierError::NotFound("t".into()).http_status(), 404);
        assert_eq!(CarrierError::InvalidConfig("t".into()).http_status(), 400);
        assert_eq!(CarrierError::Broker("t".into()).http_status(), 500);
        assert_eq!(
            CarrierError::BrokerUnavailable("t".into()).http_status(),
            500
        );
        assert_eq!(CarrierError::Server("t".into()).http_status(), 500);
    }
}
