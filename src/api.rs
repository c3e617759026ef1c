//! HTTP API and the WebSocket viewer endpoint

mod types;
mod ws;

pub use types::*;

use crate::session::{SessionRegistry, SessionSpec};
use axum::{extract::State, routing::get, Json, Router};
use std::sync::Arc;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    /// Spec applied when a connection names a session that does not exist
    /// yet. Later connections to the same id share the created instance.
    pub default_spec: SessionSpec,
}

impl AppState {
    pub fn new(registry: Arc<SessionRegistry>, default_spec: SessionSpec) -> Self {
        Self {
            registry,
            default_spec,
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/:id/ws", get(ws::session_socket))
        .route("/version", get(get_version))
        .with_state(state)
}

async fn list_sessions(State(state): State<AppState>) -> Json<SessionListResponse> {
    Json(SessionListResponse {
        sessions: state.registry.session_ids().await,
    })
}

async fn get_version() -> &'static str {
    concat!("colloquy ", env!("CARGO_PKG_VERSION"))
}
