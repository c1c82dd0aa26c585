//! Prometheus metrics for the preview controller.

use metrics::counter;

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook delivery.
pub fn webhook_received(event_type: &str) {
    counter!("preview_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record a deployment entering `status`.
pub fn deployment_transition(status: &str) {
    counter!("preview_deployment_transitions_total", "status" => status.to_string()).increment(1);
}

pub fn scm_request(operation: &str, outcome: &str) {
    counter!(
        "preview_scm_requests_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a compensating action (undoing an external side effect).
pub fn compensation(kind: &str) {
    counter!("preview_compensations_total", "kind" => kind.to_string()).increment(1);
}
