//! The error taxonomy from spec.md §7, realized as a `thiserror` enum.
//! Each variant knows the wire `error` code it maps to (§6.1); session and
//! repository code match on the appropriate variants to decide whether to
//! keep the session, close it, retry, or (for `Programmer`) abort.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or out-of-order inbound frame. Reported as an `error`
    /// frame; the session is kept or closed per the state table in §4.5.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Reserved for future admission-time authorization.
    #[error("unauthorized")]
    Authorization,

    /// Flood / overflow: the offending session is closed, the room is not.
    #[error("resource limit exceeded: {0}")]
    Resource(ResourceKind),

    /// A strict lookup found no such room.
    #[error("room not found: {0}")]
    NotFound(String),

    /// Store failure. `retryable` distinguishes transient (network hiccup,
    /// retried with backoff) from fatal (surfaced as `INTERNAL`).
    #[error("persistence error (retryable={retryable}): {source}")]
    Persistence {
        retryable: bool,
        #[source]
        source: anyhow::Error,
    },

    /// An invariant the hub itself is responsible for was violated. The
    /// process is expected to crash fast rather than limp on with
    /// inconsistent state.
    #[error("programmer error: {0}")]
    Programmer(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Overflow,
    Flood,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResourceKind::Overflow => write!(f, "overflow"),
            ResourceKind::Flood => write!(f, "flood"),
        }
    }
}

impl AppError {
    /// The wire error code from §6.1, when this error is surfaced to a client.
    pub fn wire_code(&self) -> &'static str {
        match self {
            AppError::Protocol(_) => "INVALID_MESSAGE",
            AppError::Authorization => "UNAUTHORIZED",
            AppError::Resource(ResourceKind::Overflow) => "FLOOD",
            AppError::Resource(ResourceKind::Flood) => "FLOOD",
            AppError::NotFound(_) => "ROOM_NOT_FOUND",
            AppError::Persistence { .. } => "INTERNAL",
            AppError::Programmer(_) => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Persistence { retryable: true, .. })
    }

    pub fn persistence(source: anyhow::Error) -> Self {
        // sqlx connection-level failures are the transient case we retry in
        // the background (touch_room, record_leave); anything else (a
        // constraint violation, a malformed row) is treated as fatal.
        let retryable = source
            .downcast_ref::<sqlx::Error>()
            .map(|e| matches!(e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)))
            .unwrap_or(false);
        AppError::Persistence { retryable, source }
    }
}
