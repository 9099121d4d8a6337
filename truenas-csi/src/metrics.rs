//! Prometheus metrics for the CSI driver
//!
//! Covers CSI call outcomes and latency, provisioning rollbacks and node
//! attach/detach results.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

/// Metric names
pub mod names {
    /// Counter: Total number of CSI operations by type and status
    pub const CSI_OPERATIONS_TOTAL: &str = "csi_operations_total";
    /// Histogram: Duration of CSI operations in seconds
    pub const CSI_OPERATION_DURATION_SECONDS: &str = "csi_operation_duration_seconds";
    /// Counter: Undo actions run after a failed create, by object kind and result
    pub const CSI_ROLLBACK_ACTIONS_TOTAL: &str = "csi_rollback_actions_total";
    /// Counter: Node attach/detach results by backend
    pub const CSI_NODE_OPERATIONS_TOTAL: &str = "csi_node_operations_total";
}

/// Initialize the Prometheus metrics exporter
///
/// Starts an HTTP server on the specified address that serves metrics
/// at the `/metrics` endpoint.
pub fn init_metrics(addr: SocketAddr) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on http://{}/metrics", addr);
    Ok(())
}

/// Record a CSI operation with its result
pub fn record_operation(operation: &str, status: &str, duration_secs: f64) {
    counter!(names::CSI_OPERATIONS_TOTAL, "operation" => operation.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::CSI_OPERATION_DURATION_SECONDS, "operation" => operation.to_string())
        .record(duration_secs);
}

/// Record one rollback undo action
pub fn record_rollback(object: &str, success: bool) {
    counter!(names::CSI_ROLLBACK_ACTIONS_TOTAL, "object" => object.to_string(), "success" => success.to_string())
        .increment(1);
}

/// Record a node attach or detach
pub fn record_node_operation(operation: &str, backend: &str, success: bool) {
    counter!(
        names::CSI_NODE_OPERATIONS_TOTAL,
        "operation" => operation.to_string(),
        "backend" => backend.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

/// Helper for timing operations
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    /// Complete the operation with success
    pub fn success(self) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, "success", duration);
    }

    /// Complete the operation with failure
    pub fn failure(self, error_code: &str) {
        let duration = self.start.elapsed().as_secs_f64();
        record_operation(self.operation, error_code, duration);
    }

    /// Record the outcome of `result` and pass it through.
    pub fn finish<T>(self, result: crate::error::Result<T>) -> crate::error::Result<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => self.failure(e.code_name()),
        }
        result
    }
}
