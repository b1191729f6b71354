//! HTTP handlers.

use axum::{
    Json,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, Uri, header},
    response::Response,
};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::observability::{MemoryUsage, read_memory_usage};
use crate::session::{handle_socket, workspace_id_from_host};

/// Upgrade to a session WebSocket. The workspace is named by the first label
/// of the `Host` header, e.g. `demo.codexa.dev`.
pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .or_else(|| uri.authority().map(|authority| authority.as_str()));

    let Some(workspace_id) = host.and_then(workspace_id_from_host) else {
        warn!("Refusing connection without a workspace host: {:?}", host);
        return Err(ApiError::bad_request(
            "Connection host does not name a workspace",
        ));
    };

    debug!("Upgrading session for workspace {}", workspace_id);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, workspace_id)))
}

#[derive(Debug, Serialize)]
pub struct SessionCounts {
    pub active: usize,
    pub terminals: usize,
    pub idle: usize,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    /// Seconds since the runner started.
    pub uptime: f64,
    pub memory: MemoryUsage,
    pub sessions: SessionCounts,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now().to_rfc3339(),
        uptime: state.uptime().as_secs_f64(),
        memory: read_memory_usage().await,
        sessions: SessionCounts {
            active: state.sessions.count(),
            terminals: state.terminals.count(),
            idle: state.sessions.idle_count(),
        },
    })
}
