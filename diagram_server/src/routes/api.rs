//! Status and admin API.

use axum::http::{header, HeaderMap};
use axum::response::Json;
use diagram_pipeline::{Acknowledgement, Orchestrator, RunState};
use serde::Serialize;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::config::SyncConfig;

#[derive(Debug, Serialize)]
pub struct RunsJson {
    pub repository: String,
    pub state: RunState,
    /// Newest first.
    pub recent: Vec<Acknowledgement>,
}

#[derive(Debug, Serialize)]
pub struct ReloadJson {
    pub repositories: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthJson {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthJson> {
    Json(HealthJson {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Current state and recent acknowledgements for a monitored repository.
pub fn runs(orchestrator: &Orchestrator, repository: &str) -> Option<RunsJson> {
    let state = orchestrator.state(repository)?;
    let recent = orchestrator.history(repository)?;
    Some(RunsJson {
        repository: repository.to_string(),
        state,
        recent,
    })
}

/// Admin calls need `Authorization: Bearer <webhook secret>` when a secret is set.
pub fn admin_authorized(config: &SyncConfig, headers: &HeaderMap) -> bool {
    if config.webhook_secret.is_empty() {
        return true;
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| {
            // Fixed-length digests, compared in constant time.
            let given = Sha256::digest(token.as_bytes());
            let expected = Sha256::digest(config.webhook_secret.as_bytes());
            given.as_slice().ct_eq(expected.as_slice()).into()
        })
}
