use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, params_from_iter, OptionalExtension};
use std::collections::HashMap;
use std::time::Duration;

use super::store::{KeyValueStore, ScanPage};
use crate::db::{with_conn, DbPool};
use crate::error::StoreError;

/// TTL key/value store on the shared `kv_store` table.
///
/// Expiry is wall-clock (unix milliseconds) so every process sharing the
/// database file agrees on it. Expired rows are filtered on read and purged
/// opportunistically during scans.
#[derive(Clone)]
pub struct SqliteStore {
    db: DbPool,
}

impl SqliteStore {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }

    /// Delete every expired row. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<usize, StoreError> {
        let now = now_ms();
        with_conn(&self.db, move |conn| {
            Ok(conn.execute(
                "DELETE FROM kv_store WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?1",
                params![now],
            )?)
        })
        .await
    }

    async fn upsert(&self, key: &str, value: &str, expires_at_ms: Option<i64>) -> Result<(), StoreError> {
        let key = key.to_string();
        let value = value.to_string();
        with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO kv_store (key, value, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at_ms = excluded.expires_at_ms",
                params![key, value, expires_at_ms],
            )?;
            Ok(())
        })
        .await
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let expires_at = now_ms() + ttl.as_millis() as i64;
        self.upsert(key, value, Some(expires_at)).await
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.upsert(key, value, None).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let key = key.to_string();
        let now = now_ms();
        with_conn(&self.db, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM kv_store
                     WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                    params![key, now],
                    |row| row.get::<_, String>(0),
                )
                .optional()?)
        })
        .await
    }

    async fn del(&self, key: &str) -> Result<bool, StoreError> {
        let key = key.to_string();
        let now = now_ms();
        with_conn(&self.db, move |conn| {
            let deleted = conn.execute(
                "DELETE FROM kv_store
                 WHERE key = ?1 AND (expires_at_ms IS NULL OR expires_at_ms > ?2)",
                params![key, now],
            )?;
            // Drop an expired leftover too, without reporting it as present
            conn.execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
            Ok(deleted > 0)
        })
        .await
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<String>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let keys = keys.to_vec();
        let now = now_ms();
        with_conn(&self.db, move |conn| {
            let placeholders = (2..keys.len() + 2)
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            let sql = format!(
                "SELECT key, value FROM kv_store
                 WHERE (expires_at_ms IS NULL OR expires_at_ms > ?1) AND key IN ({})",
                placeholders
            );
            let mut stmt = conn.prepare(&sql)?;
            let bind = std::iter::once(rusqlite::types::Value::Integer(now)).chain(
                keys.iter()
                    .map(|k| rusqlite::types::Value::Text(k.clone())),
            );
            let found: HashMap<String, String> = stmt
                .query_map(params_from_iter(bind), |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?;
            Ok(keys.iter().map(|k| found.get(k).cloned()).collect())
        })
        .await
    }

    async fn scan(
        &self,
        prefix: &str,
        cursor: Option<&str>,
        count: usize,
    ) -> Result<ScanPage, StoreError> {
        let prefix = prefix.to_string();
        let cursor = cursor.unwrap_or_default().to_string();
        let count = count.max(1);
        let now = now_ms();
        let page = with_conn(&self.db, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT key FROM kv_store
                 WHERE substr(key, 1, length(?1)) = ?1
                   AND key > ?2
                   AND (expires_at_ms IS NULL OR expires_at_ms > ?3)
                 ORDER BY key
                 LIMIT ?4",
            )?;
            // One extra row tells us whether another page exists
            let mut keys: Vec<String> = stmt
                .query_map(params![prefix, cursor, now, (count + 1) as i64], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            if keys.len() > count {
                keys.truncate(count);
                let next = keys.last().cloned();
                Ok(ScanPage { cursor: next, keys })
            } else {
                Ok(ScanPage { cursor: None, keys })
            }
        })
        .await?;

        if page.cursor.is_none() {
            if let Err(e) = self.purge_expired().await {
                tracing::debug!(error = %e, "kv_store purge failed");
            }
        }
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory_db;

    #[tokio::test]
    async fn test_set_get_del() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        store.set("user:lastseen:u1", "100").await.unwrap();
        assert_eq!(
            store.get("user:lastseen:u1").await.unwrap().as_deref(),
            Some("100")
        );
        assert!(store.del("user:lastseen:u1").await.unwrap());
        assert!(!store.del("user:lastseen:u1").await.unwrap());
        assert_eq!(store.get("user:lastseen:u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_keys_are_invisible() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        store
            .set_ex("user:online:u1", "1", Duration::from_millis(1))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("user:online:u1").await.unwrap(), None);
        assert_eq!(
            store.mget(&["user:online:u1".to_string()]).await.unwrap(),
            vec![None]
        );
    }

    #[tokio::test]
    async fn test_mget_single_query_alignment() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        store.set("b", "2").await.unwrap();
        store.set("a", "1").await.unwrap();
        let got = store
            .mget(&["a".into(), "missing".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(got, vec![Some("1".into()), None, Some("2".into())]);
    }

    #[tokio::test]
    async fn test_scan_with_cursor() {
        let store = SqliteStore::new(init_memory_db().unwrap());
        for i in 0..7 {
            store
                .set_ex(&format!("user:online:{}", i), "1", Duration::from_secs(60))
                .await
                .unwrap();
        }
        store.set("user:lastactive:1", "5").await.unwrap();

        let first = store.scan("user:online:", None, 4).await.unwrap();
        assert_eq!(first.keys.len(), 4);
        let cursor = first.cursor.clone().expect("more pages");
        let second = store.scan("user:online:", Some(&cursor), 4).await.unwrap();
        assert_eq!(second.keys.len(), 3);
        assert!(second.cursor.is_none());
    }
}
