use std::sync::Arc;

use crate::application::ports::RoomRepository;
use crate::bootstrap::config::Config;
use crate::infrastructure::db::PgPool;
use crate::infrastructure::realtime::Hub;

/// Router state for every HTTP and WS handler: the resolved `Config`, the
/// realtime Hub (C6), the repository port directly for REST handlers that
/// never touch the in-memory Document (plain room/snapshot CRUD), and the
/// raw pool for the `/health` liveness probe.
#[derive(Clone)]
pub struct AppContext {
    pub cfg: Config,
    pub hub: Arc<Hub>,
    pub repo: Arc<dyn RoomRepository>,
    pub pool: PgPool,
}

impl AppContext {
    pub fn new(cfg: Config, hub: Arc<Hub>, repo: Arc<dyn RoomRepository>, pool: PgPool) -> Self {
        Self { cfg, hub, repo, pool }
    }
}
