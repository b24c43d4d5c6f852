//! Server configuration — loaded from environment variables.

use std::time::Duration;

use diagram_pipeline::retry::RetryPolicy;
use diagram_pipeline::PipelineConfig;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// GitHub webhook secret for HMAC validation; also guards `/admin/reload`.
    pub webhook_secret: String,
    /// GitHub token for content reads, commits and issues.
    pub github_token: String,
    /// Pending events per repository before the webhook answers 503.
    pub queue_depth: usize,
    /// Attempts per platform call, including the first.
    pub retry_attempts: u32,
    /// First backoff delay in milliseconds; doubles per attempt.
    pub retry_base_ms: u64,
    /// Files analyzed concurrently within one run.
    pub file_concurrency: usize,
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let webhook_secret = std::env::var("DIAGRAM_WEBHOOK_SECRET").unwrap_or_default();
        let github_token = std::env::var("DIAGRAM_GITHUB_TOKEN").unwrap_or_default();
        let queue_depth = env_or("DIAGRAM_QUEUE_DEPTH", 32);
        let retry_attempts = env_or("DIAGRAM_RETRY_ATTEMPTS", 4);
        let retry_base_ms = env_or("DIAGRAM_RETRY_BASE_MS", 500);
        let file_concurrency = env_or("DIAGRAM_FILE_CONCURRENCY", 8);

        if webhook_secret.is_empty() {
            tracing::warn!("DIAGRAM_WEBHOOK_SECRET not set -- webhook signature validation disabled");
        }
        if github_token.is_empty() {
            tracing::warn!("DIAGRAM_GITHUB_TOKEN not set -- commits and issues will be rejected by GitHub");
        }

        Self {
            webhook_secret,
            github_token,
            queue_depth,
            retry_attempts,
            retry_base_ms,
            file_concurrency,
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let base_delay = Duration::from_millis(self.retry_base_ms);
        PipelineConfig {
            queue_depth: self.queue_depth.max(1),
            file_concurrency: self.file_concurrency.max(1),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts.max(1),
                base_delay,
                max_delay: base_delay.saturating_mul(16),
            },
            ..PipelineConfig::default()
        }
    }
}
