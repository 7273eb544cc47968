use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A durable collaboration scope: one Document plus the participants
/// currently attached to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    pub creator_id: String,
    pub visibility: Visibility,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Default for Visibility {
    fn default() -> Self {
        Visibility::Public
    }
}

impl std::str::FromStr for Visibility {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for Visibility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Visibility::Public => write!(f, "public"),
            Visibility::Private => write!(f, "private"),
        }
    }
}

/// A participant's identity as carried on the wire and echoed in broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// The source writes `editor` on every join and never reassigns it; the
/// variants exist so persistence and the wire format have a real type to
/// grow into, not because the hub ever picks another value today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text")]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Owner => write!(f, "owner"),
            Role::Editor => write!(f, "editor"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// An append-only row per session; `left_at` is null while the session is
/// live in this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub room_id: String,
    pub user_id: String,
    pub client_id: String,
    pub user_name: String,
    pub user_color: String,
    pub role: Role,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
}

/// A versioned, durable resume point for a room's Document.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: Uuid,
    pub room_id: String,
    pub payload: Vec<u8>,
    pub state_vector: Vec<u8>,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

/// Metadata-only view of a snapshot, used by the REST history endpoint —
/// the payload bytes are never shipped over that surface.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SnapshotMeta {
    pub id: Uuid,
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub payload_bytes: usize,
}

impl From<&Snapshot> for SnapshotMeta {
    fn from(s: &Snapshot) -> Self {
        Self {
            id: s.id,
            version: s.version,
            created_at: s.created_at,
            payload_bytes: s.payload.len(),
        }
    }
}
