//! Metrics collection and exposition.
//!
//! # Metrics
//! - `servicekit_requests_total` (counter): requests by plane, method, status
//! - `servicekit_request_duration_seconds` (histogram): latency by plane
//! - `servicekit_connections_total` (counter): accepted connections by plane
//! - `servicekit_dials_total` (counter): outbound dials by result
//! - `servicekit_lease_events_total` (counter): registry lease transitions
//! - `servicekit_upgrades_total` (counter): live upgrades by result
//!
//! # Design Decisions
//! - One Prometheus recorder per process, installed lazily
//! - Recording before installation is a silent no-op (metrics facade)

use std::sync::OnceLock;
use std::time::Instant;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

static HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder and return its render handle.
///
/// Returns `None` when another recorder already owns the process.
pub fn init_metrics() -> Option<PrometheusHandle> {
    HANDLE
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "Metrics recorder not installed");
                None
            }
        })
        .clone()
}

/// Render the current metrics in Prometheus text format.
pub fn render() -> String {
    HANDLE
        .get()
        .and_then(Option::as_ref)
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

pub fn record_request(plane: &'static str, method: &str, status: u16, start: Instant) {
    metrics::counter!(
        "servicekit_requests_total",
        "plane" => plane,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("servicekit_request_duration_seconds", "plane" => plane)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_connection(plane: &'static str) {
    metrics::counter!("servicekit_connections_total", "plane" => plane).increment(1);
}

pub fn record_dial(result: &'static str) {
    metrics::counter!("servicekit_dials_total", "result" => result).increment(1);
}

pub fn record_lease_event(event: &'static str) {
    metrics::counter!("servicekit_lease_events_total", "event" => event).increment(1);
}

pub fn record_upgrade(result: &'static str) {
    metrics::counter!("servicekit_upgrades_total", "result" => result).increment(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent_and_renders() {
        let first = init_metrics().is_some();
        let second = init_metrics().is_some();
        assert_eq!(first, second);

        record_upgrade("success");
        if first {
            assert!(render().contains("servicekit_upgrades_total"));
        }
    }
}
