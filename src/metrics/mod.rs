//! Prometheus metrics for Carrier
//!
//! Metric names are stable; tenants appear as a `tenant_id` label so
//! per-tenant series come and go with tenant lifecycle.

use crate::error::{CarrierError, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Messages processed, labeled by tenant and outcome
pub const MESSAGES_PROCESSED: &str = "carrier_messages_processed_total";
/// Active workers per tenant
pub const WORKER_COUNT: &str = "carrier_worker_count";
/// Handler processing time per tenant
pub const PROCESSING_DURATION: &str = "carrier_message_processing_duration_seconds";

pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_REQUEUED: &str = "requeued";
pub const STATUS_DEAD_LETTERED: &str = "dead_lettered";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder and describe the metrics.
///
/// Idempotent; later calls return the already-installed handle.
pub fn init_prometheus() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| CarrierError::Server(format!("metrics recorder: {}", e)))?;
    describe_metrics();
    let _ = PROMETHEUS.set(handle.clone());
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(
        MESSAGES_PROCESSED,
        "Total messages processed, labeled by tenant_id and status"
    );
    describe_gauge!(WORKER_COUNT, "Active worker tasks per tenant");
    describe_histogram!(
        PROCESSING_DURATION,
        "Message handler processing time in seconds per tenant"
    );
}

pub fn record_processed(tenant_id: &str, status: &'static str) {
    counter!(
        MESSAGES_PROCESSED,
        "tenant_id" => tenant_id.to_string(),
        "status" => status
    )
    .increment(1);
}

pub fn set_worker_count(tenant_id: &str, count: usize) {
    gauge!(WORKER_COUNT, "tenant_id" => tenant_id.to_string()).set(count as f64);
}

pub fn record_processing_duration(tenant_id: &str, elapsed: Duration) {
    histogram!(PROCESSING_DURATION, "tenant_id" => tenant_id.to_string())
        .record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    // Without an installed recorder the macros are no-ops; the helpers must
    // still be callable from any context.
    #[test]
    fn test_record_helpers_without_recorder() {
        record_processed("acme", STATUS_SUCCESS);
        record_processed("acme", STATUS_DEAD_LETTERED);
        set_worker_count("acme", 3);
        record_processing_duration("acme", Duration::from_millis(12));
    }
}
