//! `GET /api/stats` — the periodic stats emitter's data, also exposed
//! synchronously over REST for dashboards/monitoring (spec.md §6.2).

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use utoipa::ToSchema;

use crate::bootstrap::app_context::AppContext;

#[derive(Debug, Serialize, ToSchema)]
pub struct StatsResponse {
    pub live_rooms: usize,
    pub live_connections: usize,
    pub cached_documents: usize,
    pub room_connection_counts: std::collections::HashMap<String, usize>,
}

#[utoipa::path(get, path = "/api/stats", tag = "Stats", responses((status = 200, body = StatsResponse)))]
pub async fn stats(State(ctx): State<AppContext>) -> Json<StatsResponse> {
    let registry = ctx.hub.registry();
    Json(StatsResponse {
        live_rooms: registry.live_room_count().await,
        live_connections: registry.live_connection_count().await,
        cached_documents: ctx.hub.cache().live_room_count().await,
        room_connection_counts: registry.room_connection_counts().await,
    })
}

pub fn routes(ctx: AppContext) -> Router {
    Router::new().route("/stats", get(stats)).with_state(ctx)
}
