//! Prometheus metrics for bucket operations.
//!
//! Operations record through the `metrics` facade, which is a no-op until a
//! recorder is installed.  [`init_metrics`] installs the global Prometheus
//! recorder from `metrics-exporter-prometheus`; [`render`] returns the
//! exposition text.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

use crate::errors::Result;

// -- Metric name constants ----------------------------------------------------

/// Total bucket operations (counter). Labels: backend, operation, status.
pub const OPERATIONS_TOTAL: &str = "bucketfs_operations_total";

/// Bucket operation duration in seconds (histogram). Labels: backend, operation.
pub const OPERATION_DURATION_SECONDS: &str = "bucketfs_operation_duration_seconds";

/// Total bytes published by committed writers (counter). Labels: backend.
pub const BYTES_COMMITTED_TOTAL: &str = "bucketfs_bytes_committed_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the global Prometheus metrics recorder. Idempotent -- safe to call
/// multiple times (e.g. in tests). Returns a reference to the global handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    PROMETHEUS_HANDLE.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("failed to install Prometheus recorder")
    })
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(OPERATIONS_TOTAL, "Total bucket operations by type");
    describe_histogram!(
        OPERATION_DURATION_SECONDS,
        "Bucket operation duration in seconds"
    );
    describe_counter!(BYTES_COMMITTED_TOTAL, "Total bytes published by writers");
}

/// Render the Prometheus exposition text, if a recorder is installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

// -- Recording helpers --------------------------------------------------------

/// Status label for an operation result.
pub fn status_label<T>(result: &Result<T>) -> &'static str {
    match result {
        Ok(_) => "ok",
        Err(e) => e.code(),
    }
}

/// Count one finished operation.
pub fn record_operation<T>(backend: &'static str, operation: &'static str, result: &Result<T>) {
    counter!(
        OPERATIONS_TOTAL,
        "backend" => backend,
        "operation" => operation,
        "status" => status_label(result)
    )
    .increment(1);
}

/// Count bytes published by a successful commit.
pub fn record_bytes_committed(backend: &'static str, bytes: u64) {
    counter!(BYTES_COMMITTED_TOTAL, "backend" => backend).increment(bytes);
}

/// Run `fut`, recording its outcome and duration.
pub async fn observe<T, F>(backend: &'static str, operation: &'static str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let start = Instant::now();
    let result = fut.await;
    histogram!(
        OPERATION_DURATION_SECONDS,
        "backend" => backend,
        "operation" => operation
    )
    .record(start.elapsed().as_secs_f64());
    record_operation(backend, operation, &result);
    result
}

// -- Tests --------------------------------------------------------------------
