//! The thin REST wrapper over the Repository (spec.md §6.2): room CRUD and
//! snapshot history, in the teacher's `documents.rs` shape — one file per
//! resource, `#[utoipa::path]` annotations, a `routes(ctx) -> Router`
//! constructor taking `AppContext` as state. This surface never touches the
//! in-memory Document; it talks to `RoomRepository` directly, same as the
//! teacher's HTTP handlers talk to a use case over a repository port.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::bootstrap::app_context::AppContext;
use crate::domain::room::{Room, SnapshotMeta, Visibility};
use crate::error::AppError;

#[derive(Debug, Serialize, ToSchema)]
pub struct RoomResponse {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub visibility: Visibility,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

impl From<Room> for RoomResponse {
    fn from(r: Room) -> Self {
        Self {
            id: r.id,
            name: r.name,
            creator_id: r.creator_id,
            visibility: r.visibility,
            created_at: r.created_at,
            last_active: r.last_active,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateRoomRequest {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    #[serde(default)]
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateRoomRequest {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ExistsResponse {
    pub exists: bool,
}

#[derive(Debug, Deserialize)]
pub struct SnapshotsQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SnapshotsResponse {
    pub items: Vec<SnapshotMeta>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Authorization => StatusCode::UNAUTHORIZED,
            AppError::Protocol(_) => StatusCode::BAD_REQUEST,
            AppError::Resource(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Persistence { .. } | AppError::Programmer(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(serde_json::json!({ "code": self.wire_code(), "message": self.to_string() }))).into_response()
    }
}

#[utoipa::path(post, path = "/api/rooms", tag = "Rooms", request_body = CreateRoomRequest,
    responses((status = 201, body = RoomResponse), (status = 409, description = "Room id already exists")))]
pub async fn create_room(
    State(ctx): State<AppContext>,
    Json(req): Json<CreateRoomRequest>,
) -> Result<(StatusCode, Json<RoomResponse>), Response> {
    if ctx
        .repo
        .find_room(&req.id)
        .await
        .map_err(IntoResponse::into_response)?
        .is_some()
    {
        return Err(StatusCode::CONFLICT.into_response());
    }
    let room = ctx
        .repo
        .create_room(
            &req.id,
            &req.name,
            &req.creator_id,
            req.visibility.unwrap_or_default(),
        )
        .await
        .map_err(IntoResponse::into_response)?;
    Ok((StatusCode::CREATED, Json(room.into())))
}

#[utoipa::path(get, path = "/api/rooms/{id}", tag = "Rooms",
    params(("id" = String, Path)),
    responses((status = 200, body = RoomResponse), (status = 404)))]
pub async fn get_room(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<RoomResponse>, Response> {
    let room = ctx
        .repo
        .find_room(&id)
        .await
        .map_err(IntoResponse::into_response)?
        .ok_or(StatusCode::NOT_FOUND.into_response())?;
    Ok(Json(room.into()))
}

#[utoipa::path(get, path = "/api/rooms/{id}/exists", tag = "Rooms",
    params(("id" = String, Path)),
    responses((status = 200, body = ExistsResponse)))]
pub async fn room_exists(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<Json<ExistsResponse>, Response> {
    let exists = ctx
        .repo
        .find_room(&id)
        .await
        .map_err(IntoResponse::into_response)?
        .is_some();
    Ok(Json(ExistsResponse { exists }))
}

#[utoipa::path(patch, path = "/api/rooms/{id}", tag = "Rooms",
    params(("id" = String, Path)), request_body = UpdateRoomRequest,
    responses((status = 200, body = RoomResponse), (status = 404)))]
pub async fn update_room(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Json(req): Json<UpdateRoomRequest>,
) -> Result<Json<RoomResponse>, Response> {
    let room = ctx
        .repo
        .update_room(&id, req.name, req.visibility)
        .await
        .map_err(IntoResponse::into_response)?
        .ok_or(StatusCode::NOT_FOUND.into_response())?;
    Ok(Json(room.into()))
}

#[utoipa::path(delete, path = "/api/rooms/{id}", tag = "Rooms",
    params(("id" = String, Path)),
    responses((status = 204), (status = 404)))]
pub async fn delete_room(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, Response> {
    let deleted = ctx
        .repo
        .delete_room(&id)
        .await
        .map_err(IntoResponse::into_response)?;
    if deleted {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(StatusCode::NOT_FOUND.into_response())
    }
}

#[utoipa::path(get, path = "/api/rooms/{id}/snapshots", tag = "Rooms",
    params(("id" = String, Path), ("limit" = Option<i64>, Query)),
    responses((status = 200, body = SnapshotsResponse)))]
pub async fn snapshot_history(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
    Query(q): Query<SnapshotsQuery>,
) -> Result<Json<SnapshotsResponse>, Response> {
    let limit = q.limit.unwrap_or(10).clamp(1, 100);
    let items = ctx
        .repo
        .snapshot_history(&id, limit)
        .await
        .map_err(IntoResponse::into_response)?
        .iter()
        .map(SnapshotMeta::from)
        .collect();
    Ok(Json(SnapshotsResponse { items }))
}

pub fn routes(ctx: AppContext) -> Router {
    Router::new()
        .route("/rooms", post(create_room))
        .route("/rooms/:id", get(get_room).patch(update_room).delete(delete_room))
        .route("/rooms/:id/exists", get(room_exists))
        .route("/rooms/:id/snapshots", get(snapshot_history))
        .with_state(ctx)
}
