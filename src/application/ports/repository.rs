use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{Participant, Role, Room, Snapshot, Visibility};
use crate::error::AppError;

/// Durable persistence for rooms, participants, and snapshots (spec.md
/// §4.1). Every call is independently transactional — the core never holds
/// a transaction open across two of these calls.
#[async_trait]
pub trait RoomRepository: Send + Sync {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, AppError>;

    /// Fails with `AppError::Protocol`-free `AlreadyExists` semantics: a
    /// second `create_room` for the same id returns the existing row rather
    /// than erroring, since C5's handshake always calls this as
    /// "find-or-create" (spec.md §4.5 table, `find_or_create_room`).
    async fn create_room(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        visibility: Visibility,
    ) -> Result<Room, AppError>;

    async fn touch_room(&self, id: &str, now: DateTime<Utc>) -> Result<(), AppError>;

    #[allow(clippy::too_many_arguments)]
    async fn record_join(
        &self,
        room_id: &str,
        user_id: &str,
        client_id: &str,
        user_name: &str,
        user_color: &str,
        role: Role,
    ) -> Result<Participant, AppError>;

    /// Idempotent: marking an already-closed row closed again is a no-op.
    async fn record_leave(&self, client_id: &str, now: DateTime<Utc>) -> Result<(), AppError>;

    async fn newest_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, AppError>;

    async fn snapshot_history(&self, room_id: &str, limit: i64) -> Result<Vec<Snapshot>, AppError>;

    /// Server-assigned version = max(existing) + 1, atomic per room.
    async fn write_snapshot(
        &self,
        room_id: &str,
        payload: &[u8],
        state_vector: &[u8],
    ) -> Result<i64, AppError>;

    /// Deletes all but the newest `keep` snapshots for the room.
    async fn prune_snapshots(&self, room_id: &str, keep: i64) -> Result<(), AppError>;

    async fn update_room(
        &self,
        id: &str,
        name: Option<String>,
        visibility: Option<Visibility>,
    ) -> Result<Option<Room>, AppError>;

    /// Soft-deletes the room, cascading to participants and snapshots per
    /// spec.md §6.3.
    async fn delete_room(&self, id: &str) -> Result<bool, AppError>;
}
