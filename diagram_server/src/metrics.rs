//! Prometheus metrics for the webhook server.
//!
//! Run, issue and retry metrics are recorded by the pipeline itself.

use metrics::counter;

/// Initialize metrics exporter (Prometheus).
pub fn init_metrics() {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
    if let Err(e) = builder.install() {
        tracing::warn!("Failed to install Prometheus exporter: {}", e);
    }
}

/// Record a webhook received event.
pub fn webhook_received(event_type: &str) {
    counter!("diagram_webhooks_received_total", "event" => event_type.to_string()).increment(1);
}

/// Record how a webhook delivery was answered.
pub fn webhook_outcome(outcome: &str) {
    counter!("diagram_webhook_outcomes_total", "outcome" => outcome.to_string()).increment(1);
}

/// Record a target reload attempt.
pub fn targets_reloaded(result: &str) {
    counter!("diagram_target_reloads_total", "result" => result.to_string()).increment(1);
}
