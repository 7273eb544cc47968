//! The `/ws` upgrade entrypoint (spec.md §6.1). Room membership and user
//! identity travel in the first `connect` frame, not in the upgrade
//! request itself, so this handler has nothing to resolve beyond the
//! socket upgrade and the hub's shutdown gate.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::infrastructure::realtime::Hub;
use crate::presentation::ws::session;

#[utoipa::path(
    get,
    path = "/ws",
    responses(
        (status = 101, description = "Switching Protocols (WebSocket upgrade)"),
        (status = 503, description = "Hub is shutting down and refusing new sessions")
    ),
    tag = "Realtime"
)]
pub async fn ws_entry(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
) -> Result<impl IntoResponse, StatusCode> {
    if !hub.is_accepting() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(ws.on_upgrade(move |socket| session::run_session(hub, socket)))
}
