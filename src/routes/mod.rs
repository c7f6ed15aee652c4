// HTTP + WebSocket routes

mod http;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};

use crate::capability::CapabilityProbe;
use crate::dispatcher::Dispatcher;
use crate::models::{HostCapabilities, HostStatusReport};
use crate::reporter::Reporter;

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub reporter: Arc<Reporter>,
    pub probe: Arc<CapabilityProbe>,
    /// Probed once at startup.
    pub capabilities: Arc<HostCapabilities>,
    pub status_tx: broadcast::Sender<HostStatusReport>,
    pub ws_status_connections: Arc<AtomicUsize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "hostagent" })) // GET /
        .route("/version", get(http::version_handler)) // GET /version
        .route("/api/host", get(http::host_handler)) // GET /api/host
        .route("/command", post(http::command_handler)) // POST /command
        .route("/ws/status", get(ws::ws_status)) // WS /ws/status
        .layer(CorsLayer::new().allow_origin(Any))
        .with_state(state)
}
