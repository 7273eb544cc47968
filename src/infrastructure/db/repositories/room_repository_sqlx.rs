use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::application::ports::RoomRepository;
use crate::domain::{Participant, Role, Room, Snapshot, Visibility};
use crate::error::AppError;
use crate::infrastructure::db::PgPool;

pub struct SqlxRoomRepository {
    pool: PgPool,
}

impl SqlxRoomRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_room(row: &sqlx::postgres::PgRow) -> Room {
    let visibility: String = row.get("visibility");
    Room {
        id: row.get("id"),
        name: row.get("name"),
        creator_id: row.get("creator_id"),
        visibility: visibility.parse().unwrap_or(Visibility::Public),
        created_at: row.get("created_at"),
        last_active: row.get("last_active"),
    }
}

#[async_trait]
impl RoomRepository for SqlxRoomRepository {
    async fn find_room(&self, id: &str) -> Result<Option<Room>, AppError> {
        let row = sqlx::query(
            r#"SELECT id, name, creator_id, visibility, created_at, last_active
               FROM rooms WHERE id = $1 AND deleted_at IS NULL"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(row.as_ref().map(row_to_room))
    }

    async fn create_room(
        &self,
        id: &str,
        name: &str,
        creator_id: &str,
        visibility: Visibility,
    ) -> Result<Room, AppError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"INSERT INTO rooms (id, name, creator_id, visibility, created_at, last_active)
               VALUES ($1, $2, $3, $4, $5, $5)
               ON CONFLICT (id) DO UPDATE SET id = EXCLUDED.id
               RETURNING id, name, creator_id, visibility, created_at, last_active"#,
        )
        .bind(id)
        .bind(name)
        .bind(creator_id)
        .bind(visibility.to_string())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(row_to_room(&row))
    }

    async fn touch_room(&self, id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        sqlx::query("UPDATE rooms SET last_active = $2 WHERE id = $1 AND deleted_at IS NULL")
            .bind(id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::persistence(e.into()))?;
        Ok(())
    }

    async fn record_join(
        &self,
        room_id: &str,
        user_id: &str,
        client_id: &str,
        user_name: &str,
        user_color: &str,
        role: Role,
    ) -> Result<Participant, AppError> {
        let now = Utc::now();
        let row = sqlx::query(
            r#"INSERT INTO participants
                   (id, room_id, user_id, client_id, user_name, user_color, role, joined_at, left_at)
               VALUES (gen_random_uuid(), $1, $2, $3, $4, $5, $6, $7, NULL)
               RETURNING id, room_id, user_id, client_id, user_name, user_color, role, joined_at, left_at"#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(client_id)
        .bind(user_name)
        .bind(user_color)
        .bind(role.to_string())
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;

        let role: String = row.get("role");
        Ok(Participant {
            id: row.get("id"),
            room_id: row.get("room_id"),
            user_id: row.get("user_id"),
            client_id: row.get("client_id"),
            user_name: row.get("user_name"),
            user_color: row.get("user_color"),
            role: match role.as_str() {
                "owner" => Role::Owner,
                "viewer" => Role::Viewer,
                _ => Role::Editor,
            },
            joined_at: row.get("joined_at"),
            left_at: row.get("left_at"),
        })
    }

    async fn record_leave(&self, client_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        // Idempotent: already-closed rows are simply not matched.
        sqlx::query(
            "UPDATE participants SET left_at = $2 WHERE client_id = $1 AND left_at IS NULL",
        )
        .bind(client_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(())
    }

    async fn newest_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, AppError> {
        let row = sqlx::query(
            r#"SELECT id, room_id, payload, state_vector, version, created_at
               FROM snapshots WHERE room_id = $1
               ORDER BY version DESC LIMIT 1"#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(row.map(|r| Snapshot {
            id: r.get("id"),
            room_id: r.get("room_id"),
            payload: r.get("payload"),
            state_vector: r.get("state_vector"),
            version: r.get("version"),
            created_at: r.get("created_at"),
        }))
    }

    async fn snapshot_history(&self, room_id: &str, limit: i64) -> Result<Vec<Snapshot>, AppError> {
        let rows = sqlx::query(
            r#"SELECT id, room_id, payload, state_vector, version, created_at
               FROM snapshots WHERE room_id = $1
               ORDER BY version DESC LIMIT $2"#,
        )
        .bind(room_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(rows
            .into_iter()
            .map(|r| Snapshot {
                id: r.get("id"),
                room_id: r.get("room_id"),
                payload: r.get("payload"),
                state_vector: r.get("state_vector"),
                version: r.get("version"),
                created_at: r.get("created_at"),
            })
            .collect())
    }

    async fn write_snapshot(
        &self,
        room_id: &str,
        payload: &[u8],
        state_vector: &[u8],
    ) -> Result<i64, AppError> {
        // Atomic per room: lock the room row so two concurrent saves can't
        // both compute the same next version.
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::persistence(e.into()))?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(room_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::persistence(e.into()))?;

        let next_version: i64 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next FROM snapshots WHERE room_id = $1",
        )
        .bind(room_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| AppError::persistence(e.into()))?
        .get("next");

        sqlx::query(
            r#"INSERT INTO snapshots (id, room_id, payload, state_vector, version, created_at)
               VALUES (gen_random_uuid(), $1, $2, $3, $4, now())"#,
        )
        .bind(room_id)
        .bind(payload)
        .bind(state_vector)
        .bind(next_version)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;

        tx.commit().await.map_err(|e| AppError::persistence(e.into()))?;
        Ok(next_version)
    }

    async fn prune_snapshots(&self, room_id: &str, keep: i64) -> Result<(), AppError> {
        sqlx::query(
            r#"DELETE FROM snapshots
               WHERE room_id = $1
                 AND version <= (
                     SELECT version FROM snapshots
                     WHERE room_id = $1
                     ORDER BY version DESC
                     OFFSET $2 LIMIT 1
                 )"#,
        )
        .bind(room_id)
        .bind(keep)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(())
    }

    async fn update_room(
        &self,
        id: &str,
        name: Option<String>,
        visibility: Option<Visibility>,
    ) -> Result<Option<Room>, AppError> {
        let row = sqlx::query(
            r#"UPDATE rooms
               SET name = COALESCE($2, name),
                   visibility = COALESCE($3, visibility)
               WHERE id = $1 AND deleted_at IS NULL
               RETURNING id, name, creator_id, visibility, created_at, last_active"#,
        )
        .bind(id)
        .bind(name)
        .bind(visibility.map(|v| v.to_string()))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;
        Ok(row.as_ref().map(row_to_room))
    }

    async fn delete_room(&self, id: &str) -> Result<bool, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::persistence(e.into()))?;

        let result = sqlx::query(
            "UPDATE rooms SET deleted_at = now() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::persistence(e.into()))?;

        if result.rows_affected() == 0 {
            tx.commit().await.map_err(|e| AppError::persistence(e.into()))?;
            return Ok(false);
        }

        sqlx::query("UPDATE participants SET left_at = COALESCE(left_at, now()) WHERE room_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::persistence(e.into()))?;

        sqlx::query("DELETE FROM snapshots WHERE room_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| AppError::persistence(e.into()))?;

        tx.commit().await.map_err(|e| AppError::persistence(e.into()))?;
        Ok(true)
    }
}
