//! Pipeline metrics. No-ops until a recorder is installed (the server installs Prometheus).

use metrics::{counter, histogram};

/// Record a finished run.
pub fn run_finished(status: &str, duration_ms: u64) {
    counter!("diagram_runs_total", "status" => status.to_string()).increment(1);
    histogram!("diagram_run_duration_ms").record(duration_ms as f64);
}

/// Record metadata files written or deleted by a batch.
pub fn metadata_files(op: &str, count: usize) {
    counter!("diagram_metadata_files_total", "op" => op.to_string()).increment(count as u64);
}

/// Record a validation-failure issue opened.
pub fn issue_opened() {
    counter!("diagram_issues_opened_total").increment(1);
}

/// Record a retried platform call.
pub fn platform_retry(op: &str) {
    counter!("diagram_platform_retries_total", "op" => op.to_string()).increment(1);
}
