//! Prometheus metrics for lifecycle manager observability.

use metrics::{counter, histogram};

/// Install the Prometheus recorder. The returned handle renders the
/// current snapshot in text exposition format.
pub fn init_metrics() -> Option<metrics_exporter_prometheus::PrometheusHandle> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    match builder.install_recorder() {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Record a build state transition.
pub fn build_status_changed(status: &str) {
    counter!("ilm_builds_total", "status" => status.to_string()).increment(1);
}

/// Record a failed step of a child collection cascade.
pub fn cascade_failure(collection: &str) {
    counter!("ilm_cascade_failures_total", "collection" => collection.to_string()).increment(1);
}

/// Record how many children a replace-all pass rewrote.
pub fn child_sync_records(collection: &str, count: usize) {
    histogram!("ilm_child_sync_records", "collection" => collection.to_string())
        .record(count as f64);
}

pub fn audit_event(event_type: &str) {
    counter!("ilm_audit_events_total", "event" => event_type.to_string()).increment(1);
}

pub fn audit_event_dropped() {
    counter!("ilm_audit_events_dropped_total").increment(1);
}
