//! Webhook intake — signature check, payload normalization, queueing.

use axum::http::{HeaderMap, StatusCode};
use diagram_pipeline::{ChangeEvent, Orchestrator, SubmitOutcome};
use serde::Serialize;

use crate::config::SyncConfig;
use crate::models::github_push::PushPayload;
use crate::services::github_service;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct WebhookReply {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl WebhookReply {
    fn new(status: &'static str) -> Self {
        Self {
            status,
            commit: None,
            reason: None,
        }
    }

    fn commit(mut self, commit: &str) -> Self {
        self.commit = Some(commit.to_string());
        self
    }

    fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Decode a delivery into a `ChangeEvent`.
///
/// Native GitHub push payloads are normalized; other native GitHub events
/// (ping, pull requests, ...) yield `None`. Anything else must already be a
/// normalized event.
pub fn parse_event(headers: &HeaderMap, body: &[u8]) -> Result<Option<ChangeEvent>, String> {
    let payload: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON: {e}"))?;

    let github_event = headers.get("x-github-event").and_then(|v| v.to_str().ok());
    let normalized = payload.get("event_type").is_some();

    match github_event {
        Some("push") if payload.get("commits").is_some_and(|c| c.is_array()) => {
            let push: PushPayload =
                serde_json::from_value(payload).map_err(|e| format!("invalid push payload: {e}"))?;
            Ok(push.into_change_event())
        }
        Some(kind) if !normalized => {
            tracing::debug!("Ignoring GitHub {kind} event");
            Ok(None)
        }
        _ => serde_json::from_value(payload)
            .map(Some)
            .map_err(|e| format!("invalid change event: {e}")),
    }
}

/// Validate, normalize and queue one delivery. Never waits for the run.
pub fn handle_webhook(
    config: &SyncConfig,
    orchestrator: &Orchestrator,
    headers: &HeaderMap,
    body: &[u8],
) -> (StatusCode, WebhookReply) {
    let signature = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if !github_service::validate_signature(&config.webhook_secret, body, signature) {
        tracing::warn!("Webhook signature validation failed");
        return (
            StatusCode::UNAUTHORIZED,
            WebhookReply::new("rejected").reason("invalid signature"),
        );
    }

    let event = match parse_event(headers, body) {
        Ok(Some(event)) => event,
        Ok(None) => return (StatusCode::OK, WebhookReply::new("ignored").reason("not a push")),
        Err(reason) => {
            tracing::warn!("Rejected webhook payload: {reason}");
            return (StatusCode::BAD_REQUEST, WebhookReply::new("invalid").reason(reason));
        }
    };

    let commit = event.commit_sha.clone();
    let repository = event.repository.clone();
    match orchestrator.submit(event) {
        SubmitOutcome::Queued(_) => {
            tracing::info!(repo = %repository, commit = %commit, "Event queued");
            (StatusCode::ACCEPTED, WebhookReply::new("queued").commit(&commit))
        }
        SubmitOutcome::Duplicate => (StatusCode::OK, WebhookReply::new("duplicate").commit(&commit)),
        SubmitOutcome::Ignored(reason) => {
            tracing::debug!(repo = %repository, commit = %commit, "Event ignored: {reason}");
            (StatusCode::OK, WebhookReply::new("ignored").commit(&commit).reason(reason))
        }
        SubmitOutcome::UnknownRepository => {
            tracing::debug!(repo = %repository, "No target registered for repository");
            (
                StatusCode::NOT_FOUND,
                WebhookReply::new("unknown_repository").reason(repository),
            )
        }
        SubmitOutcome::Busy => (
            StatusCode::SERVICE_UNAVAILABLE,
            WebhookReply::new("busy").commit(&commit).reason("repository queue is full"),
        ),
    }
}
