//! C2: the in-memory CRDT document cache (spec.md §4.2).
//!
//! One `Document` per active room, guarded by a single per-room mutex —
//! the "single owner" discipline spec.md §5 asks for (apply/encode/save
//! never tear). Rooms are created lazily on first `acquire`, seeded from
//! the newest persisted snapshot, and destroyed after a grace period of
//! zero attachments.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Mutex, RwLock};

use crate::application::ports::RoomRepository;
use crate::domain::document::{new_document, CrdtDocument};
use crate::error::{AppError, ResourceKind};

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub save_interval: Duration,
    pub destroy_grace: Duration,
    pub snapshot_keep: i64,
    /// Hard cap on updates queued for a room's single-owner apply point
    /// (spec.md §5). Exceeding it floods the calling session; it never
    /// blocks or drops the update.
    pub apply_queue: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            save_interval: Duration::from_secs(30),
            destroy_grace: Duration::from_secs(60),
            snapshot_keep: 10,
            apply_queue: 1024,
        }
    }
}

struct RoomState {
    document: Box<dyn CrdtDocument>,
    attached_count: usize,
    /// Bumped every time `attached_count` transitions 0 -> 1. A destroy
    /// timer that wakes up after the grace period compares its captured
    /// epoch against the current one: a mismatch means someone re-acquired
    /// the room in the meantime, so the destroy is cancelled.
    epoch: u64,
    dirty: bool,
    last_save_at: Option<Instant>,
}

struct RoomEntry {
    state: Mutex<RoomState>,
    /// The room's single-owner apply point (spec.md §5): every `update` is
    /// enqueued here rather than applied inline, so a session reading
    /// frames back-to-back is never stalled behind the owner lock and a
    /// session that outruns the owner is rejected at enqueue time instead of
    /// queueing without bound. Bounded at `CacheConfig::apply_queue`; a
    /// dedicated task drains it in order and is the only writer of
    /// `state.document`.
    apply_tx: mpsc::Sender<Vec<u8>>,
}

struct CacheInner {
    repo: Arc<dyn RoomRepository>,
    rooms: RwLock<HashMap<String, Arc<RoomEntry>>>,
    config: CacheConfig,
}

#[derive(Clone)]
pub struct DocumentCache {
    inner: Arc<CacheInner>,
}

impl DocumentCache {
    pub fn new(repo: Arc<dyn RoomRepository>, config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                repo,
                rooms: RwLock::new(HashMap::new()),
                config,
            }),
        }
    }

    /// Creates the room's Document if absent (loading the newest snapshot),
    /// installs its periodic save timer, and increments `attached_count`.
    pub async fn acquire(&self, room_id: &str) -> Result<(), AppError> {
        let existing = { self.inner.rooms.read().await.get(room_id).cloned() };
        let entry = match existing {
            Some(entry) => entry,
            None => self.create_room(room_id).await?,
        };

        let mut state = entry.state.lock().await;
        if state.attached_count == 0 {
            state.epoch += 1;
        }
        state.attached_count += 1;
        tracing::debug!(room_id, attached = state.attached_count, "cache:acquire");
        Ok(())
    }

    async fn create_room(&self, room_id: &str) -> Result<Arc<RoomEntry>, AppError> {
        let mut rooms = self.inner.rooms.write().await;
        if let Some(entry) = rooms.get(room_id) {
            return Ok(entry.clone());
        }

        let snapshot = self.inner.repo.newest_snapshot(room_id).await?;
        let mut document = new_document();
        if let Some(snap) = &snapshot {
            if let Err(err) = document.load_full(&snap.payload) {
                tracing::error!(room_id, error = %err, "cache:corrupt_snapshot_starting_empty");
                document = new_document();
            }
        }

        let (apply_tx, apply_rx) = mpsc::channel(self.inner.config.apply_queue);
        let entry = Arc::new(RoomEntry {
            state: Mutex::new(RoomState {
                document,
                attached_count: 0,
                epoch: 0,
                dirty: false,
                last_save_at: None,
            }),
            apply_tx,
        });
        rooms.insert(room_id.to_string(), entry.clone());
        drop(rooms);

        self.spawn_applier(entry.clone(), apply_rx);
        self.spawn_periodic_save(room_id.to_string());
        tracing::debug!(room_id, "cache:document_created");
        Ok(entry)
    }

    /// Drains the room's apply queue in order, applying each update under
    /// the owner lock. Exits once the entry is dropped from the rooms map
    /// and no caller holds a cloned `Arc<RoomEntry>` anymore, which closes
    /// `apply_tx` and ends `recv`.
    fn spawn_applier(&self, entry: Arc<RoomEntry>, mut apply_rx: mpsc::Receiver<Vec<u8>>) {
        tokio::spawn(async move {
            while let Some(payload) = apply_rx.recv().await {
                let mut state = entry.state.lock().await;
                state.document.apply(&payload);
                state.dirty = true;
            }
        });
    }

    /// Decrements `attached_count`. At zero, schedules a final save and
    /// destroy after the configured grace delay.
    pub async fn release(&self, room_id: &str) -> Result<(), AppError> {
        let Some(entry) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return Ok(());
        };

        let epoch = {
            let mut state = entry.state.lock().await;
            if state.attached_count == 0 {
                // Never drop below zero; release is idempotent.
                return Ok(());
            }
            state.attached_count -= 1;
            tracing::debug!(room_id, attached = state.attached_count, "cache:release");
            if state.attached_count != 0 {
                return Ok(());
            }
            state.epoch
        };

        let cache = self.clone();
        let room_id = room_id.to_string();
        let grace = self.inner.config.destroy_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            cache.try_destroy(&room_id, epoch).await;
        });
        Ok(())
    }

    async fn try_destroy(&self, room_id: &str, epoch: u64) {
        let Some(entry) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return;
        };
        let mut state = entry.state.lock().await;
        if state.attached_count != 0 || state.epoch != epoch {
            // Re-acquired during the grace window.
            return;
        }
        if let Err(err) = self.do_save(&mut state, room_id).await {
            tracing::error!(room_id, error = %err, "cache:final_save_failed");
        }
        drop(state);
        self.inner.rooms.write().await.remove(room_id);
        tracing::info!(room_id, "cache:document_destroyed");
    }

    /// Enqueues the opaque bytes onto the room's apply point. Returns
    /// `Ok(false)` if the room has no live Document (nothing to apply to),
    /// and `Err(Resource(Flood))` if the apply queue is already full —
    /// this check never blocks, and a full queue never silently drops the
    /// update: the caller (a session's reader loop) is expected to close
    /// itself with `FLOOD` rather than retry.
    pub async fn apply_update(&self, room_id: &str, payload: &[u8]) -> Result<bool, AppError> {
        let Some(entry) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return Ok(false);
        };
        match entry.apply_tx.try_send(payload.to_vec()) {
            Ok(()) => Ok(true),
            Err(mpsc::error::TrySendError::Full(_)) => Err(AppError::Resource(ResourceKind::Flood)),
            // The room is mid-destroy; the caller's session is about to be
            // released too, so dropping the update here is harmless.
            Err(mpsc::error::TrySendError::Closed(_)) => Ok(false),
        }
    }

    /// Serializes the current full state, if the room is live.
    pub async fn encode_full(&self, room_id: &str) -> Result<Option<Vec<u8>>, AppError> {
        let Some(entry) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return Ok(None);
        };
        let state = entry.state.lock().await;
        Ok(Some(state.document.encode_full()))
    }

    /// If dirty, writes a new snapshot and prunes older ones. Returns
    /// whether a save actually happened.
    pub async fn save(&self, room_id: &str) -> Result<bool, AppError> {
        let Some(entry) = self.inner.rooms.read().await.get(room_id).cloned() else {
            return Ok(false);
        };
        let mut state = entry.state.lock().await;
        self.do_save(&mut state, room_id).await
    }

    async fn do_save(&self, state: &mut RoomState, room_id: &str) -> Result<bool, AppError> {
        if !state.dirty {
            return Ok(false);
        }
        let payload = state.document.encode_full();
        let state_vector = state.document.state_vector();
        self.inner
            .repo
            .write_snapshot(room_id, &payload, &state_vector)
            .await?;
        self.inner
            .repo
            .prune_snapshots(room_id, self.inner.config.snapshot_keep)
            .await?;
        state.dirty = false;
        state.last_save_at = Some(Instant::now());
        tracing::debug!(room_id, "cache:saved");
        Ok(true)
    }

    /// All room ids currently live in the process, for shutdown flush and
    /// the stats endpoint.
    pub async fn live_room_ids(&self) -> Vec<String> {
        self.inner.rooms.read().await.keys().cloned().collect()
    }

    pub async fn live_room_count(&self) -> usize {
        self.inner.rooms.read().await.len()
    }

    fn spawn_periodic_save(&self, room_id: String) {
        let cache = self.clone();
        let interval = self.inner.config.save_interval;
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let exists = cache.inner.rooms.read().await.contains_key(&room_id);
                if !exists {
                    break;
                }
                // Each tick runs to completion before the next sleep starts,
                // so a slow save is never overlapped by another tick.
                if let Err(err) = cache.save(&room_id).await {
                    tracing::error!(room_id = %room_id, error = %err, "cache:periodic_save_failed");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Participant, Role, Room, Snapshot, Visibility};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tokio::sync::Mutex as TokioMutex;

    #[derive(Default)]
    struct FakeRepo {
        snapshots: TokioMutex<Vec<(String, Vec<u8>, Vec<u8>)>>,
        version: AtomicI64,
    }

    #[async_trait]
    impl RoomRepository for FakeRepo {
        async fn find_room(&self, _id: &str) -> Result<Option<Room>, AppError> {
            Ok(None)
        }
        async fn create_room(
            &self,
            id: &str,
            name: &str,
            creator_id: &str,
            visibility: Visibility,
        ) -> Result<Room, AppError> {
            let now = Utc::now();
            Ok(Room {
                id: id.to_string(),
                name: name.to_string(),
                creator_id: creator_id.to_string(),
                visibility,
                created_at: now,
                last_active: now,
            })
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
        async fn record_leave(&self, _client_id: &str, _now: chrono::DateTime<Utc>) -> Result<(), AppError> {
            Ok(())
        }
        async fn newest_snapshot(&self, room_id: &str) -> Result<Option<Snapshot>, AppError> {
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
                    version: self.version.load(Ordering::SeqCst),
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
            Ok(self.version.fetch_add(1, Ordering::SeqCst) + 1)
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

    fn small_config() -> CacheConfig {
        CacheConfig {
            save_interval: Duration::from_secs(3600),
            destroy_grace: Duration::from_millis(20),
            snapshot_keep: 10,
            apply_queue: 1024,
        }
    }

    #[tokio::test]
    async fn acquire_then_apply_then_encode() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo, small_config());

        cache.acquire("r1").await.unwrap();
        cache.apply_update("r1", b"AAEC").await.unwrap();
        tokio::task::yield_now().await; // let the applier task drain the queue
        let encoded = cache.encode_full("r1").await.unwrap().unwrap();
        // 4-byte count header plus the one applied update's length-prefixed bytes.
        assert!(encoded.len() > 4);
    }

    #[tokio::test]
    async fn apply_update_on_unknown_room_returns_false() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo, small_config());
        let applied = cache.apply_update("ghost", b"x").await.unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn release_to_zero_destroys_after_grace() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo.clone(), small_config());

        cache.acquire("r1").await.unwrap();
        cache.apply_update("r1", b"hello").await.unwrap();
        cache.release("r1").await.unwrap();

        assert_eq!(cache.live_room_count().await, 1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.live_room_count().await, 0);
        assert_eq!(repo.snapshots.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn reacquire_during_grace_cancels_destroy() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo, small_config());

        cache.acquire("r1").await.unwrap();
        cache.release("r1").await.unwrap();
        cache.acquire("r1").await.unwrap(); // before the 20ms grace elapses
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(cache.live_room_count().await, 1);
    }

    #[tokio::test]
    async fn resume_from_snapshot_matches_prior_state() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo.clone(), small_config());

        cache.acquire("r2").await.unwrap();
        cache.apply_update("r2", b"one").await.unwrap();
        cache.apply_update("r2", b"two").await.unwrap();
        cache.apply_update("r2", b"three").await.unwrap();
        tokio::task::yield_now().await; // let the applier task drain the queue
        let original = cache.encode_full("r2").await.unwrap().unwrap();
        cache.release("r2").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.live_room_count().await, 0);

        cache.acquire("r2").await.unwrap();
        let resumed = cache.encode_full("r2").await.unwrap().unwrap();
        assert_eq!(resumed, original);
    }

    #[tokio::test]
    async fn apply_beyond_queue_cap_returns_flood() {
        let repo = Arc::new(FakeRepo::default());
        let mut config = small_config();
        config.apply_queue = 2;
        let cache = DocumentCache::new(repo, config);

        cache.acquire("r1").await.unwrap();
        cache.apply_update("r1", b"one").await.unwrap();
        cache.apply_update("r1", b"two").await.unwrap();
        let err = cache.apply_update("r1", b"three").await.unwrap_err();
        assert!(matches!(err, AppError::Resource(ResourceKind::Flood)));
    }

    #[tokio::test]
    async fn release_never_drops_attached_count_below_zero() {
        let repo = Arc::new(FakeRepo::default());
        let cache = DocumentCache::new(repo, small_config());

        cache.acquire("r1").await.unwrap();
        cache.release("r1").await.unwrap();
        cache.release("r1").await.unwrap();
        cache.release("r1").await.unwrap();
        // idempotent: no panic, no underflow
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cache.live_room_count().await, 0);
    }
}
