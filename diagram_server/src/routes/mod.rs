//! HTTP routes — webhook intake, run status, target reload, health.

pub mod api;
pub mod webhook;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use diagram_pipeline::Orchestrator;

use crate::config::SyncConfig;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct SyncRouterState {
    pub config: Arc<SyncConfig>,
    pub orchestrator: Arc<Orchestrator>,
    pub targets_file: Arc<PathBuf>,
}

pub fn sync_router(state: SyncRouterState) -> Router {
    Router::new()
        .route("/webhook", post(webhook_handler))
        .route("/runs/{owner}/{repo}", get(runs_handler))
        .route("/admin/reload", post(reload_handler))
        .route("/health", get(api::health))
        .with_state(state)
}

async fn webhook_handler(
    State(state): State<SyncRouterState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<webhook::WebhookReply>) {
    crate::metrics::webhook_received(
        headers
            .get("x-github-event")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("normalized"),
    );

    let (status, reply) = webhook::handle_webhook(&state.config, &state.orchestrator, &headers, &body);
    crate::metrics::webhook_outcome(reply.status);
    (status, Json(reply))
}

async fn runs_handler(
    State(state): State<SyncRouterState>,
    Path((owner, repo)): Path<(String, String)>,
) -> Result<Json<api::RunsJson>, StatusCode> {
    api::runs(&state.orchestrator, &format!("{owner}/{repo}"))
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn reload_handler(
    State(state): State<SyncRouterState>,
    headers: HeaderMap,
) -> Result<Json<api::ReloadJson>, (StatusCode, String)> {
    if !api::admin_authorized(&state.config, &headers) {
        return Err((StatusCode::UNAUTHORIZED, "missing or wrong bearer token".to_string()));
    }
    crate::services::target_service::reload(&state.orchestrator, &state.targets_file)
        .map(|repositories| Json(api::ReloadJson { repositories }))
        .map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))
}
