//! C6: the composition root (spec.md §4.6). Owns the repository, the
//! document cache, and the connection registry; accepts new sockets,
//! mints client ids, and runs the periodic stats job and graceful
//! shutdown sequence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::application::ports::RoomRepository;
use crate::application::services::{CacheConfig, DocumentCache};
use crate::domain::{Participant, Role, Room, User, Visibility};
use crate::error::AppError;
use crate::infrastructure::realtime::registry::{
    CloseReason, ConnectionRegistry, RoomMember, SessionHandle,
};

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub cache: CacheConfig,
    pub outbound_queue: usize,
    pub max_frame_bytes: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub shutdown_drain: Duration,
    pub stats_interval: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            outbound_queue: 256,
            max_frame_bytes: 1024 * 1024,
            heartbeat_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            shutdown_drain: Duration::from_secs(5),
            stats_interval: Duration::from_secs(60),
        }
    }
}

pub struct ConnectResult {
    pub room: Room,
    pub participant: Participant,
    pub snapshot_data: Vec<u8>,
    pub members: Vec<RoomMember>,
}

pub struct Hub {
    repo: Arc<dyn RoomRepository>,
    cache: DocumentCache,
    registry: Arc<ConnectionRegistry>,
    config: HubConfig,
    accepting: AtomicBool,
}

impl Hub {
    pub fn new(repo: Arc<dyn RoomRepository>, config: HubConfig) -> Self {
        let cache = DocumentCache::new(repo.clone(), config.cache.clone());
        Self {
            repo,
            cache,
            registry: Arc::new(ConnectionRegistry::new()),
            config,
            accepting: AtomicBool::new(true),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn cache(&self) -> &DocumentCache {
        &self.cache
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn mint_client_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Pending -> Active transition's side effects, up to but not including
    /// registry attachment: find-or-create the room, touch it, record the
    /// join, acquire the Document, and assemble everything a
    /// `sync-response` needs. Deliberately stops short of `C3.attach` so
    /// the caller can place its own `sync-response` on the wire before
    /// anything else can be broadcast to it — see `finalize_connect`.
    ///
    /// Repository failure here is fatal for this session (spec.md §4.5):
    /// the caller is expected to transition to Closing and emit an error.
    pub async fn prepare_connect(
        &self,
        room_id: &str,
        user: &User,
        client_id: &str,
    ) -> Result<ConnectResult, AppError> {
        let room = match self.repo.find_room(room_id).await? {
            Some(room) => room,
            None => {
                self.repo
                    .create_room(room_id, room_id, &user.id, Visibility::Public)
                    .await?
            }
        };
        self.touch_room_background(room_id.to_string());

        let participant = self
            .repo
            .record_join(room_id, &user.id, client_id, &user.name, &user.color, Role::Editor)
            .await?;

        // From here on a participant row is open (`left_at = NULL`). If the
        // handshake fails past this point the caller never reaches Active,
        // so the session's normal disconnect teardown never runs — close
        // the row (and release the Document, if it was ever acquired)
        // ourselves instead of leaking them.
        match self.acquire_and_assemble(room_id).await {
            Ok((snapshot_data, members)) => Ok(ConnectResult {
                room,
                participant,
                snapshot_data,
                members,
            }),
            Err(err) => {
                self.abort_connect(room_id, client_id).await;
                Err(err)
            }
        }
    }

    async fn acquire_and_assemble(&self, room_id: &str) -> Result<(Vec<u8>, Vec<RoomMember>), AppError> {
        self.cache.acquire(room_id).await?;
        let snapshot_data = self.cache.encode_full(room_id).await?.unwrap_or_default();
        let members = self.registry.room_members(room_id).await;
        Ok((snapshot_data, members))
    }

    /// Closes out a handshake that opened a participant row (and possibly
    /// acquired the Document) but never reached Active — e.g. `acquire`
    /// itself failed, or the caller's later `finalize_connect` failed after
    /// `prepare_connect` already succeeded. The session's normal disconnect
    /// teardown never runs in that case, so this releases the Document
    /// (a no-op if it was never acquired) and closes the participant row
    /// instead of leaving both leaked.
    pub async fn abort_connect(&self, room_id: &str, client_id: &str) {
        if let Err(err) = self.cache.release(room_id).await {
            tracing::error!(room_id = %room_id, error = %err, "hub:abort_connect_release_failed");
        }
        self.record_leave_background(client_id.to_string());
    }

    /// Attaches the session to the registry, making it visible to future
    /// broadcasts. Call only after the session's own `sync-response` has
    /// already been placed on its outbound queue (spec.md §5 ordering
    /// guarantee #2).
    pub async fn finalize_connect(&self, room_id: &str, session: SessionHandle) -> Result<(), AppError> {
        self.registry.attach(room_id, session).await
    }

    pub async fn apply_update(&self, room_id: &str, payload: &[u8]) -> Result<bool, AppError> {
        self.cache.apply_update(room_id, payload).await
    }

    pub async fn broadcast(&self, room_id: &str, frame: &[u8], except: Option<&str>) {
        self.registry.broadcast(room_id, frame, except).await;
    }

    pub async fn room_members(&self, room_id: &str) -> Vec<RoomMember> {
        self.registry.room_members(room_id).await
    }

    /// Closing -> Closed side effects: detach from the registry, release
    /// the Document, and record the departure (retried in the background
    /// per spec.md §4.1/§7; a transient failure here must never stall
    /// teardown of the socket).
    pub async fn disconnect(&self, client_id: &str) -> Option<(String, User)> {
        let detached = self.registry.detach(client_id).await;
        if let Some((room_id, _)) = &detached {
            if let Err(err) = self.cache.release(room_id).await {
                tracing::error!(room_id = %room_id, error = %err, "hub:release_failed");
            }
        }
        self.record_leave_background(client_id.to_string());
        detached
    }

    fn touch_room_background(&self, room_id: String) {
        let repo = self.repo.clone();
        tokio::spawn(async move {
            retry_transient("touch_room", || {
                let repo = repo.clone();
                let room_id = room_id.clone();
                async move { repo.touch_room(&room_id, Utc::now()).await }
            })
            .await;
        });
    }

    fn record_leave_background(&self, client_id: String) {
        let repo = self.repo.clone();
        tokio::spawn(async move {
            retry_transient("record_leave", || {
                let repo = repo.clone();
                let client_id = client_id.clone();
                async move { repo.record_leave(&client_id, Utc::now()).await }
            })
            .await;
        });
    }

    /// Emits a periodic summary of live rooms and connections. A real
    /// metrics pipeline would sink this into Prometheus/StatsD; logging it
    /// structurally is what the teacher's own services do with
    /// `tracing::info!` at the boundaries that matter.
    pub fn spawn_stats_emitter(self: &Arc<Self>) {
        let hub = self.clone();
        let interval = self.config.stats_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let rooms = hub.registry.live_room_count().await;
                let connections = hub.registry.live_connection_count().await;
                let cached_documents = hub.cache.live_room_count().await;
                tracing::info!(rooms, connections, cached_documents, "hub:stats");
            }
        });
    }

    /// Refuse new sockets, give live sessions up to `shutdown_drain` to
    /// drain their outbound queues and close themselves, then flush every
    /// dirty Document regardless of whether its sessions finished closing
    /// in time.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        let client_ids = self.registry.all_client_ids().await;
        tracing::info!(sessions = client_ids.len(), "hub:shutdown_begin");

        for client_id in &client_ids {
            self.registry.trigger_close(client_id, CloseReason::Shutdown).await;
        }

        tokio::time::sleep(self.config.shutdown_drain).await;

        for room_id in self.cache.live_room_ids().await {
            if let Err(err) = self.cache.save(&room_id).await {
                tracing::error!(room_id = %room_id, error = %err, "hub:shutdown_flush_failed");
            }
        }
        tracing::info!("hub:shutdown_complete");
    }
}

async fn retry_transient<F, Fut>(op: &'static str, mut f: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<(), AppError>>,
{
    let mut attempt = 0u32;
    loop {
        match f().await {
            Ok(()) => return,
            Err(err) if err.is_retryable() && attempt < 5 => {
                attempt += 1;
                let backoff = Duration::from_millis(100 * 2u64.pow(attempt));
                tracing::warn!(op, attempt, error = %err, "hub:retrying_persistence");
                tokio::time::sleep(backoff).await;
            }
            Err(err) => {
                tracing::error!(op, error = %err, "hub:persistence_failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Snapshot;
    use crate::infrastructure::realtime::registry::{CloseSignal, SessionRecord};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicI64;
    use tokio::sync::mpsc;
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct FakeRepo {
        rooms: TokioMutex<std::collections::HashMap<String, Room>>,
        snapshots: TokioMutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
        version: AtomicI64,
        fail_newest_snapshot: std::sync::atomic::AtomicBool,
        left_client_ids: TokioMutex<Vec<String>>,
    }

    #[async_trait]
    impl RoomRepository for FakeRepo {
        async fn find_room(&self, id: &str) -> Result<Option<Room>, AppError> {
            Ok(self.rooms.lock().await.get(id).cloned())
        }
        async fn create_room(
            &self,
            id: &str,
            name: &str,
            creator_id: &str,
            visibility: Visibility,
        ) -> Result<Room, AppError> {
            let now = Utc::now();
            let room = Room {
                id: id.to_string(),
                name: name.to_string(),
                creator_id: creator_id.to_string(),
                visibility,
                created_at: now,
                last_active: now,
            };
            self.rooms.lock().await.insert(id.to_string(), room.clone());
            Ok(room)
        }
        async fn touch_room(&self, _id: &str, _now: chrono::DateTime<Utc>) -> Result<(), AppError> {
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
            Ok(Participant {
                id: uuid::Uuid::new_v4(),
                room_id: room_id.to_string(),
                user_id: user_id.to_string(),
                client_id: client_id.to_string(),
                user_name: user_name.to_string(),
                user_color: user_color.to_string(),
                role,
                joined_at: Utc::now(),
                left_at: None,
            })
        }
        async fn record_leave(&self, client_id: &str, _now: chrono::DateTime<Utc>) -> Result<(), AppError> {
            self.left_client_ids.lock().await.push(client_id.to_string());
            Ok(())
        }
        async fn newest_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, AppError> {
            if self.fail_newest_snapshot.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(AppError::persistence(anyhow::anyhow!("store unavailable")));
            }
            let snaps = self.snapshots.lock().await;
            Ok(snaps
                .iter()
                .rev()
                .find(|(id, _, _)| id == room_id)
                .map(|(id, payload, sv)| Snapshot {
                    id: uuid::Uuid::new_v4(),
                    room_id: id.clone(),
                    payload: payload.clone(),
                    state_vector: sv.clone(),
                    version: self.version.load(std::sync::atomic::Ordering::SeqCst),
                    created_at: Utc::now(),
                }))
        }
        async fn snapshot_history(&self, _room_id: &str, _limit: i64) -> Result<Vec<Snapshot>, AppError> {
            Ok(vec![])
        }
        async fn write_snapshot(
            &self,
            room_id: &str,
            payload: &[u8],
            state_vector: &[u8],
        ) -> Result<i64, AppError> {
            self.snapshots
                .lock()
                .await
                .push((room_id.to_string(), payload.to_vec(), state_vector.to_vec()));
            Ok(self.version.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1)
        }
        async fn prune_snapshots(&self, _room_id: &str, _keep: i64) -> Result<(), AppError> {
            Ok(())
        }
        async fn update_room(
            &self,
            _id: &str,
            _name: Option<String>,
            _visibility: Option<Visibility>,
        ) -> Result<Option<Room>, AppError> {
            Ok(None)
        }
        async fn delete_room(&self, _id: &str) -> Result<bool, AppError> {
            Ok(false)
        }
    }

    fn test_hub(repo: Arc<FakeRepo>) -> Hub {
        let mut config = HubConfig::default();
        config.cache.destroy_grace = Duration::from_millis(20);
        config.cache.save_interval = Duration::from_secs(3600);
        Hub::new(repo, config)
    }

    fn fake_session(client_id: &str, user: User, queue: usize) -> (SessionHandle, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(queue);
        let record = SessionRecord {
            client_id: client_id.to_string(),
            user,
            joined_at: Utc::now(),
            outbound: tx,
            close: Arc::new(CloseSignal::default()),
        };
        (SessionHandle(Arc::new(record)), rx)
    }

    fn user(id: &str, name: &str, color: &str) -> User {
        User {
            id: id.to_string(),
            name: name.to_string(),
            color: color.to_string(),
        }
    }

    /// S1: two clients in the same room fan out updates to each other but
    /// never receive their own echo, and both see the full participant list.
    #[tokio::test]
    async fn two_clients_fan_out_without_self_echo() {
        let repo = Arc::new(FakeRepo::default());
        let hub = test_hub(repo);

        let a = user("u1", "A", "#f00");
        let connect_a = hub.prepare_connect("r1", &a, "ca").await.unwrap();
        assert_eq!(connect_a.members.len(), 0);
        let (session_a, mut rx_a) = fake_session("ca", a.clone(), 8);
        hub.finalize_connect("r1", session_a).await.unwrap();

        let b = user("u2", "B", "#0f0");
        let connect_b = hub.prepare_connect("r1", &b, "cb").await.unwrap();
        assert_eq!(connect_b.members.len(), 1);
        let (session_b, mut rx_b) = fake_session("cb", b.clone(), 8);
        hub.finalize_connect("r1", session_b).await.unwrap();

        assert_eq!(hub.room_members("r1").await.len(), 2);

        hub.apply_update("r1", b"AAEC").await.unwrap();
        hub.broadcast("r1", b"update-from-b", Some("cb")).await;

        assert_eq!(rx_a.recv().await.unwrap(), b"update-from-b");
        assert!(rx_b.try_recv().is_err());
    }

    /// S2: after every session releases and the grace window elapses, a new
    /// joiner resumes from the persisted snapshot with equal document bytes.
    #[tokio::test]
    async fn resume_from_snapshot_after_last_leave() {
        let repo = Arc::new(FakeRepo::default());
        let hub = test_hub(repo);

        let a = user("u1", "A", "#f00");
        hub.prepare_connect("r2", &a, "ca").await.unwrap();
        let (session_a, _rx_a) = fake_session("ca", a, 8);
        hub.finalize_connect("r2", session_a).await.unwrap();

        hub.apply_update("r2", b"one").await.unwrap();
        hub.apply_update("r2", b"two").await.unwrap();
        hub.apply_update("r2", b"three").await.unwrap();
        tokio::task::yield_now().await;
        let before = hub.cache().encode_full("r2").await.unwrap().unwrap();

        hub.disconnect("ca").await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(hub.cache().live_room_count().await, 0);

        let c = user("u3", "C", "#00f");
        let connect_c = hub.prepare_connect("r2", &c, "cc").await.unwrap();
        assert_eq!(connect_c.snapshot_data, before);
    }

    /// A transient store failure after `record_join` (here: `acquire`'s
    /// snapshot load) must not leave an open participant row or a held
    /// Document attachment behind — `prepare_connect` itself closes both
    /// out on the failure path, since the caller never reaches Active.
    #[tokio::test]
    async fn failed_acquire_closes_participant_row_and_releases_document() {
        let repo = Arc::new(FakeRepo::default());
        repo.fail_newest_snapshot.store(true, std::sync::atomic::Ordering::SeqCst);
        let hub = test_hub(repo.clone());

        let a = user("u1", "A", "#f00");
        let err = hub.prepare_connect("r3", &a, "ca").await.unwrap_err();
        assert!(matches!(err, AppError::Persistence { .. }));

        tokio::task::yield_now().await; // let the spawned record_leave retry task run
        assert_eq!(repo.left_client_ids.lock().await.clone(), vec!["ca".to_string()]);
        assert_eq!(hub.cache().live_room_count().await, 0);
    }
}
