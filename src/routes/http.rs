// HTTP handlers: version, host registration info, command endpoint

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use super::AppState;
use crate::models::Command;
use crate::version::{NAME, VERSION, agent_version};

/// GET /version: service name and version (from Cargo.toml at build time).
pub(super) async fn version_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "name": NAME,
        "version": VERSION,
        "agent": agent_version(),
    }))
}

/// GET /api/host: the startup registration payload, rebuilt on each request.
pub(super) async fn host_handler(State(state): State<AppState>) -> impl IntoResponse {
    let health = state.reporter.check_health().await;
    match state.probe.startup_info(&state.capabilities, health).await {
        Ok((host, pools)) => (
            StatusCode::OK,
            Json(serde_json::json!({ "host": host, "pools": pools })),
        ),
        Err(e) => {
            tracing::warn!(error = %e, operation = "startup_info", "host info failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
        }
    }
}

/// POST /command: one Command in, one Answer out. Loss of the hypervisor
/// connection is 503 so the orchestrator can treat the host as disconnected.
pub(super) async fn command_handler(
    State(state): State<AppState>,
    Json(command): Json<Command>,
) -> impl IntoResponse {
    match state.dispatcher.dispatch(command).await {
        Ok(answer) => (StatusCode::OK, Json(serde_json::to_value(&answer).unwrap_or_default())),
        Err(e) if e.is_connectivity() => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": e.to_string() })),
        ),
    }
}
