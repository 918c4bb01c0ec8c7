use std::sync::Arc;

use crate::broadcasts::pipeline::HubSendPipeline;
use crate::broadcasts::repository::{BroadcastRepository, SqliteBroadcastRepository};
use crate::chat::store::SqliteChatStore;
use crate::chat::ChatStore;
use crate::config::{Config, RealtimeSettings, StoreBackend};
use crate::db::DbPool;
use crate::presence::memory::MemoryStore;
use crate::presence::sqlite::SqliteStore;
use crate::presence::store::KeyValueStore;
use crate::presence::PresenceService;
use crate::scheduler::queue::{ClaimLock, JobQueue, MemoryClaimLock, MemoryJobQueue};
use crate::scheduler::sqlite::{SqliteClaimLock, SqliteJobQueue};
use crate::scheduler::BroadcastScheduler;
use crate::ws::handlers::default_handlers;
use crate::ws::hub::Hub;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// SQLite connection wrapped in Arc<Mutex>
    pub db: DbPool,
    /// JWT signing secret (256-bit random key)
    pub jwt_secret: Vec<u8>,
    /// Live connections, subscriptions and the message handler table
    pub hub: Arc<Hub>,
    pub presence: PresenceService,
    pub chat: Arc<dyn ChatStore>,
    pub broadcasts: Arc<dyn BroadcastRepository>,
    pub scheduler: Arc<BroadcastScheduler>,
    /// Per-connection limits and timings
    pub realtime: RealtimeSettings,
}

impl AppState {
    /// Wire every service from the resolved config. The scheduler is built but
    /// not started; the caller owns its lifecycle.
    pub fn build(config: &Config, db: DbPool, jwt_secret: Vec<u8>) -> Self {
        let (kv, queue, lock) = match config.coordination_store {
            StoreBackend::Sqlite => coordination(
                SqliteStore::new(db.clone()),
                SqliteJobQueue::new(db.clone()),
                SqliteClaimLock::new(db.clone()),
            ),
            StoreBackend::Memory => coordination(
                MemoryStore::new(),
                MemoryJobQueue::new(),
                MemoryClaimLock::new(),
            ),
        };

        let presence = PresenceService::new(kv, config.presence.online_ttl());
        let chat: Arc<dyn ChatStore> = Arc::new(SqliteChatStore::new(db.clone()));
        let broadcasts: Arc<dyn BroadcastRepository> =
            Arc::new(SqliteBroadcastRepository::new(db.clone()));

        let hub = Arc::new(Hub::new(default_handlers(chat.clone(), presence.clone())));
        let pipeline = Arc::new(HubSendPipeline::new(hub.clone(), broadcasts.clone()));
        let scheduler = Arc::new(BroadcastScheduler::new(
            queue,
            lock,
            broadcasts.clone(),
            pipeline,
            config.scheduler.clone(),
        ));

        Self {
            db,
            jwt_secret,
            hub,
            presence,
            chat,
            broadcasts,
            scheduler,
            realtime: config.realtime.clone(),
        }
    }
}

type Coordination = (Arc<dyn KeyValueStore>, Arc<dyn JobQueue>, Arc<dyn ClaimLock>);

fn coordination(
    kv: impl KeyValueStore + 'static,
    queue: impl JobQueue + 'static,
    lock: impl ClaimLock + 'static,
) -> Coordination {
    (Arc::new(kv), Arc::new(queue), Arc::new(lock))
}
