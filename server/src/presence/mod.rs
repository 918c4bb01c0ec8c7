//! Online/offline presence, backed by a TTL key/value store.
//!
//! Independent of the websocket registry: a user is online while
//! `user:online:<id>` exists. Writes report errors to the caller so they can
//! be logged; reads degrade to "unknown" (`None`) when the store fails.

pub mod memory;
pub mod routes;
pub mod sqlite;
pub mod store;

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::StoreError;
use store::KeyValueStore;

pub const ONLINE_PREFIX: &str = "user:online:";
pub const LAST_SEEN_PREFIX: &str = "user:lastseen:";
pub const LAST_ACTIVE_PREFIX: &str = "user:lastactive:";

/// Keys fetched per scan page when enumerating online users.
const SCAN_PAGE_SIZE: usize = 100;

pub fn online_key(user_id: &str) -> String {
    format!("{}{}", ONLINE_PREFIX, user_id)
}

pub fn last_seen_key(user_id: &str) -> String {
    format!("{}{}", LAST_SEEN_PREFIX, user_id)
}

pub fn last_active_key(user_id: &str) -> String {
    format!("{}{}", LAST_ACTIVE_PREFIX, user_id)
}

/// Presence snapshot for one user. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Presence {
    pub user_id: String,
    pub is_online: bool,
    pub last_seen: Option<i64>,
    pub last_active: Option<i64>,
}

#[derive(Clone)]
pub struct PresenceService {
    store: Arc<dyn KeyValueStore>,
    online_ttl: Duration,
}

impl PresenceService {
    pub fn new(store: Arc<dyn KeyValueStore>, online_ttl: Duration) -> Self {
        Self { store, online_ttl }
    }

    pub fn online_ttl(&self) -> Duration {
        self.online_ttl
    }

    /// Create or refresh the online key and stamp last active.
    pub async fn set_online(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp().to_string();
        self.store
            .set_ex(&online_key(user_id), &now, self.online_ttl)
            .await?;
        self.store.set(&last_active_key(user_id), &now).await
    }

    /// Drop the online key and stamp last seen and last active.
    pub async fn set_offline(&self, user_id: &str) -> Result<(), StoreError> {
        let now = Utc::now().timestamp().to_string();
        self.store.del(&online_key(user_id)).await?;
        self.store.set(&last_seen_key(user_id), &now).await?;
        self.store.set(&last_active_key(user_id), &now).await
    }

    /// `None` when the store could not be read.
    pub async fn is_online(&self, user_id: &str) -> Option<bool> {
        match self.store.exists(&online_key(user_id)).await {
            Ok(online) => Some(online),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "Presence read failed");
                None
            }
        }
    }

    pub async fn get_presence(&self, user_id: &str) -> Option<Presence> {
        self.get_multiple_presence(&[user_id.to_string()])
            .await
            .and_then(|mut all| all.pop())
    }

    /// Presence for many users in one batched read, aligned with `user_ids`.
    pub async fn get_multiple_presence(&self, user_ids: &[String]) -> Option<Vec<Presence>> {
        if user_ids.is_empty() {
            return Some(Vec::new());
        }
        let keys: Vec<String> = user_ids
            .iter()
            .flat_map(|id| [online_key(id), last_seen_key(id), last_active_key(id)])
            .collect();

        let values = match self.store.mget(&keys).await {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(users = user_ids.len(), error = %e, "Batched presence read failed");
                return None;
            }
        };

        Some(
            user_ids
                .iter()
                .zip(values.chunks(3))
                .map(|(user_id, chunk)| presence_from_values(user_id, chunk, self.online_ttl))
                .collect(),
        )
    }

    /// Every user with a live online key. Approximate under concurrent expiry.
    pub async fn get_online_users(&self) -> Option<Vec<String>> {
        let mut users = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = match self
                .store
                .scan(ONLINE_PREFIX, cursor.as_deref(), SCAN_PAGE_SIZE)
                .await
            {
                Ok(page) => page,
                Err(e) => {
                    tracing::warn!(error = %e, "Online user scan failed");
                    return None;
                }
            };
            users.extend(
                page.keys
                    .iter()
                    .filter_map(|k| k.strip_prefix(ONLINE_PREFIX))
                    .map(str::to_string),
            );
            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Some(users)
    }
}

fn presence_from_values(user_id: &str, chunk: &[Option<String>], online_ttl: Duration) -> Presence {
    let parse = |v: Option<&Option<String>>| v.and_then(|v| v.as_deref()?.parse::<i64>().ok());
    let is_online = chunk.first().is_some_and(Option::is_some);
    let last_seen = parse(chunk.get(1));
    let last_active = parse(chunk.get(2));

    // A key that lapsed without a disconnect went offline one TTL after its
    // last refresh, which is later than any last-seen stamp.
    let last_seen = if is_online {
        last_seen
    } else {
        let lapsed_at = last_active.map(|active| active + online_ttl.as_secs() as i64);
        match (last_seen, last_active) {
            (Some(seen), Some(active)) if active > seen => lapsed_at,
            (None, Some(_)) => lapsed_at,
            (seen, _) => seen,
        }
    };

    Presence {
        user_id: user_id.to_string(),
        is_online,
        last_seen,
        last_active,
    }
}
