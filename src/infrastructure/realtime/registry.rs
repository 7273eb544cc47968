//! C3: the connection registry (spec.md §4.3).
//!
//! A primary map (`client_id -> Session`) and a secondary index
//! (`room_id -> set<client_id>`) kept in agreement. Broadcast is
//! non-blocking with respect to slow receivers: a full or closed outbound
//! queue marks that session for teardown but never stalls the room.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::sync::RwLock;

use crate::domain::User;
use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    Overflow,
    Flood,
    Internal,
    Shutdown,
}

impl CloseReason {
    pub fn wire_code(&self) -> &'static str {
        match self {
            CloseReason::Overflow => "FLOOD",
            CloseReason::Flood => "FLOOD",
            CloseReason::Internal => "INTERNAL",
            CloseReason::Shutdown => "INTERNAL",
        }
    }
}

/// A one-shot, settable-from-anywhere signal a reader/writer task selects
/// on to learn it should tear itself down, and why.
#[derive(Default)]
pub struct CloseSignal {
    reason: OnceLock<CloseReason>,
    notify: tokio::sync::Notify,
}

impl CloseSignal {
    pub fn trigger(&self, reason: CloseReason) {
        if self.reason.set(reason).is_ok() {
            self.notify.notify_waiters();
        }
    }

    pub async fn triggered(&self) -> CloseReason {
        loop {
            if let Some(reason) = self.reason.get() {
                return *reason;
            }
            self.notify.notified().await;
        }
    }

    pub fn reason(&self) -> Option<CloseReason> {
        self.reason.get().copied()
    }
}

pub struct SessionRecord {
    pub client_id: String,
    pub user: User,
    pub joined_at: DateTime<Utc>,
    pub outbound: mpsc::Sender<Vec<u8>>,
    pub close: Arc<CloseSignal>,
}

#[derive(Clone)]
pub struct SessionHandle(pub Arc<SessionRecord>);

pub struct RoomMember {
    pub client_id: String,
    pub user: User,
    pub joined_at: DateTime<Utc>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    primary: RwLock<HashMap<String, (String, SessionHandle)>>, // client_id -> (room_id, handle)
    secondary: RwLock<HashMap<String, HashSet<String>>>,       // room_id -> client_ids
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn attach(&self, room_id: &str, session: SessionHandle) -> Result<(), AppError> {
        let client_id = session.0.client_id.clone();
        let mut primary = self.primary.write().await;
        if primary.contains_key(&client_id) {
            return Err(AppError::Programmer(format!(
                "client {client_id} already attached"
            )));
        }
        primary.insert(client_id.clone(), (room_id.to_string(), session));
        drop(primary);

        let mut secondary = self.secondary.write().await;
        secondary
            .entry(room_id.to_string())
            .or_default()
            .insert(client_id);
        Ok(())
    }

    /// Idempotent: returns `None` if the client was not attached.
    pub async fn detach(&self, client_id: &str) -> Option<(String, User)> {
        let removed = self.primary.write().await.remove(client_id);
        let (room_id, session) = removed?;

        let mut secondary = self.secondary.write().await;
        if let Some(members) = secondary.get_mut(&room_id) {
            members.remove(client_id);
            if members.is_empty() {
                secondary.remove(&room_id);
            }
        }
        Some((room_id, session.0.user.clone()))
    }

    /// Enqueues `frame` to every attached session in `room_id` except
    /// `except`. Never blocks: a full or closed queue marks that session
    /// for teardown via its `CloseSignal` and broadcast continues.
    pub async fn broadcast(&self, room_id: &str, frame: &[u8], except: Option<&str>) {
        let targets: Vec<SessionHandle> = {
            let secondary = self.secondary.read().await;
            let Some(members) = secondary.get(room_id) else {
                return;
            };
            let primary = self.primary.read().await;
            members
                .iter()
                .filter(|id| Some(id.as_str()) != except)
                .filter_map(|id| primary.get(id).map(|(_, h)| h.clone()))
                .collect()
        };

        for handle in targets {
            if let Err(err) = handle.0.outbound.try_send(frame.to_vec()) {
                match err {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(client_id = %handle.0.client_id, room_id, "registry:outbound_overflow");
                        handle.0.close.trigger(CloseReason::Overflow);
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        // Writer already gone; detach will happen on its own teardown path.
                    }
                }
            }
        }
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        let secondary = self.secondary.read().await;
        let Some(members) = secondary.get(room_id) else {
            return Vec::new();
        };
        let primary = self.primary.read().await;
        members
            .iter()
            .filter_map(|id| primary.get(id))
            .map(|(_, handle)| RoomMember {
                client_id: handle.0.client_id.clone(),
                user: handle.0.user.clone(),
                joined_at: handle.0.joined_at,
            })
            .collect()
    }

    pub async fn room_of(&self, client_id: &str) -> Option<String> {
        self.primary
            .read()
            .await
            .get(client_id)
            .map(|(room_id, _)| room_id.clone())
    }

    pub async fn live_connection_count(&self) -> usize {
        self.primary.read().await.len()
    }

    pub async fn live_room_count(&self) -> usize {
        self.secondary.read().await.len()
    }

    pub async fn room_connection_counts(&self) -> HashMap<String, usize> {
        self.secondary
            .read()
            .await
            .iter()
            .map(|(room, members)| (room.clone(), members.len()))
            .collect()
    }

    pub async fn all_client_ids(&self) -> Vec<String> {
        self.primary.read().await.keys().cloned().collect()
    }

    /// Signals one session to close without removing it from the registry;
    /// the session's own teardown path is what eventually calls `detach`.
    pub async fn trigger_close(&self, client_id: &str, reason: CloseReason) -> bool {
        match self.primary.read().await.get(client_id) {
            Some((_, handle)) => {
                handle.0.close.trigger(reason);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn make_session(client_id: &str, queue: usize) -> (SessionHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(queue);
        let record = SessionRecord {
            client_id: client_id.to_string(),
            user: User {
                id: "u1".into(),
                name: "A".into(),
                color: "#fff".into(),
            },
            joined_at: Utc::now(),
            outbound: tx,
            close: Arc::new(CloseSignal::default()),
        };
        (SessionHandle(Arc::new(record)), rx)
    }

    #[tokio::test]
    async fn attach_and_room_members_agree_with_secondary_index() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = make_session("c1", 4);
        let (h2, _rx2) = make_session("c2", 4);
        registry.attach("r1", h1).await.unwrap();
        registry.attach("r1", h2).await.unwrap();

        assert_eq!(registry.live_room_count().await, 1);
        assert_eq!(registry.room_members("r1").await.len(), 2);
    }

    #[tokio::test]
    async fn double_attach_same_client_fails() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = make_session("c1", 4);
        let (h1b, _rx1b) = make_session("c1", 4);
        registry.attach("r1", h1).await.unwrap();
        assert!(registry.attach("r1", h1b).await.is_err());
    }

    #[tokio::test]
    async fn detach_removes_empty_room_bucket() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = make_session("c1", 4);
        registry.attach("r1", h1).await.unwrap();
        registry.detach("c1").await;
        assert_eq!(registry.live_room_count().await, 0);
    }

    #[tokio::test]
    async fn detach_is_idempotent() {
        let registry = ConnectionRegistry::new();
        assert!(registry.detach("ghost").await.is_none());
        let (h1, _rx1) = make_session("c1", 4);
        registry.attach("r1", h1).await.unwrap();
        assert!(registry.detach("c1").await.is_some());
        assert!(registry.detach("c1").await.is_none());
    }

    #[tokio::test]
    async fn broadcast_skips_except_and_is_non_blocking() {
        let registry = ConnectionRegistry::new();
        let (h1, mut rx1) = make_session("c1", 4);
        let (h2, mut rx2) = make_session("c2", 4);
        registry.attach("r1", h1).await.unwrap();
        registry.attach("r1", h2).await.unwrap();

        registry.broadcast("r1", b"hello", Some("c2")).await;

        assert_eq!(rx1.recv().await.unwrap(), b"hello");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn overflow_triggers_close_signal_without_blocking_room() {
        let registry = ConnectionRegistry::new();
        let (h1, _rx1) = make_session("slow", 1);
        let (h2, mut rx2) = make_session("fast", 8);
        registry.attach("r1", h1.clone()).await.unwrap();
        registry.attach("r1", h2).await.unwrap();

        // Fill the slow session's queue past capacity.
        registry.broadcast("r1", b"one", None).await;
        registry.broadcast("r1", b"two", None).await;

        assert_eq!(h1.0.close.reason(), Some(CloseReason::Overflow));
        // The fast session still receives both frames.
        assert_eq!(rx2.recv().await.unwrap(), b"one");
        assert_eq!(rx2.recv().await.unwrap(), b"two");
    }
}
