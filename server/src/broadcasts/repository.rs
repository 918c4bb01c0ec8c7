use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use super::{Broadcast, BroadcastStatus, NewBroadcast};
use crate::db::{with_conn, DbPool};
use crate::error::StoreError;

/// Persisted broadcast records.
///
/// Transitions are single conditional updates that report whether they
/// applied. `begin_send` moves `scheduled → sending` and is the one claim a
/// worker needs before fanning out; `mark_sent` and `mark_failed` only finish a
/// `sending` broadcast, and `mark_cancelled` only stops a `scheduled` one.
#[async_trait]
pub trait BroadcastRepository: Send + Sync {
    async fn create(&self, new: NewBroadcast) -> Result<Broadcast, StoreError>;

    async fn get(&self, id: &str) -> Result<Broadcast, StoreError>;

    /// `None` if the broadcast does not exist.
    async fn status(&self, id: &str) -> Result<Option<BroadcastStatus>, StoreError>;

    async fn recipients(&self, id: &str) -> Result<Vec<String>, StoreError>;

    /// Claim a `scheduled` broadcast for sending. `false` means another worker
    /// or a cancel got there first.
    async fn begin_send(&self, id: &str) -> Result<bool, StoreError>;

    async fn mark_sent(&self, id: &str, sent_at: i64) -> Result<bool, StoreError>;

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool, StoreError>;

    async fn mark_cancelled(&self, id: &str) -> Result<bool, StoreError>;

    /// Every broadcast still `scheduled`, past-due ones included.
    async fn list_scheduled(&self) -> Result<Vec<Broadcast>, StoreError>;
}

#[derive(Clone)]
pub struct SqliteBroadcastRepository {
    db: DbPool,
}

impl SqliteBroadcastRepository {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

const SELECT_BROADCAST: &str = "SELECT id, tenant_id, created_by, content, status, scheduled_at,
        sent_at, failure_reason, created_at FROM broadcasts";

fn row_to_broadcast(row: &rusqlite::Row<'_>) -> rusqlite::Result<Broadcast> {
    let status: String = row.get(4)?;
    let status = BroadcastStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            4,
            rusqlite::types::Type::Text,
            format!("unknown broadcast status {}", status).into(),
        )
    })?;
    Ok(Broadcast {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        created_by: row.get(2)?,
        content: row.get(3)?,
        status,
        scheduled_at: row.get(5)?,
        sent_at: row.get(6)?,
        failure_reason: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn load_broadcast(conn: &Connection, id: &str) -> Result<Broadcast, StoreError> {
    conn.query_row(
        &format!("{} WHERE id = ?1", SELECT_BROADCAST),
        params![id],
        row_to_broadcast,
    )
    .optional()?
    .ok_or_else(|| StoreError::NotFound(format!("broadcast {}", id)))
}

impl SqliteBroadcastRepository {
    async fn transition(
        &self,
        id: &str,
        sql: &'static str,
        extra: Option<rusqlite::types::Value>,
    ) -> Result<bool, StoreError> {
        let id = id.to_string();
        with_conn(&self.db, move |conn| {
            let changed = match extra {
                Some(value) => conn.execute(sql, params![id, value])?,
                None => conn.execute(sql, params![id])?,
            };
            Ok(changed == 1)
        })
        .await
    }
}

#[async_trait]
impl BroadcastRepository for SqliteBroadcastRepository {
    async fn create(&self, new: NewBroadcast) -> Result<Broadcast, StoreError> {
        with_conn(&self.db, move |conn| {
            let id = uuid::Uuid::now_v7().to_string();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO broadcasts (id, tenant_id, created_by, content, status, scheduled_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, 'scheduled', ?5, ?6)",
                params![
                    id,
                    new.tenant_id,
                    new.created_by,
                    new.content,
                    new.scheduled_at,
                    Utc::now().to_rfc3339()
                ],
            )?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO broadcast_recipients (broadcast_id, user_id) VALUES (?1, ?2)",
                )?;
                for user_id in &new.recipients {
                    stmt.execute(params![id, user_id])?;
                }
            }
            tx.commit()?;
            load_broadcast(conn, &id)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Broadcast, StoreError> {
        let id = id.to_string();
        with_conn(&self.db, move |conn| load_broadcast(conn, &id)).await
    }

    async fn status(&self, id: &str) -> Result<Option<BroadcastStatus>, StoreError> {
        let id = id.to_string();
        with_conn(&self.db, move |conn| {
            let status: Option<String> = conn
                .query_row(
                    "SELECT status FROM broadcasts WHERE id = ?1",
                    params![id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(status.as_deref().and_then(BroadcastStatus::parse))
        })
        .await
    }

    async fn recipients(&self, id: &str) -> Result<Vec<String>, StoreError> {
        let id = id.to_string();
        with_conn(&self.db, move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id FROM broadcast_recipients WHERE broadcast_id = ?1 ORDER BY user_id",
            )?;
            let recipients = stmt
                .query_map(params![id], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(recipients)
        })
        .await
    }

    async fn begin_send(&self, id: &str) -> Result<bool, StoreError> {
        self.transition(
            id,
            "UPDATE broadcasts SET status = 'sending' WHERE id = ?1 AND status = 'scheduled'",
            None,
        )
        .await
    }

    async fn mark_sent(&self, id: &str, sent_at: i64) -> Result<bool, StoreError> {
        self.transition(
            id,
            "UPDATE broadcasts SET status = 'sent', sent_at = ?2 WHERE id = ?1 AND status = 'sending'",
            Some(sent_at.into()),
        )
        .await
    }

    async fn mark_failed(&self, id: &str, reason: &str) -> Result<bool, StoreError> {
        self.transition(
            id,
            "UPDATE broadcasts SET status = 'failed', failure_reason = ?2 WHERE id = ?1 AND status = 'sending'",
            Some(reason.to_string().into()),
        )
        .await
    }

    async fn mark_cancelled(&self, id: &str) -> Result<bool, StoreError> {
        self.transition(
            id,
            "UPDATE broadcasts SET status = 'cancelled' WHERE id = ?1 AND status = 'scheduled'",
            None,
        )
        .await
    }

    async fn list_scheduled(&self) -> Result<Vec<Broadcast>, StoreError> {
        with_conn(&self.db, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{} WHERE status = 'scheduled' ORDER BY scheduled_at",
                SELECT_BROADCAST
            ))?;
            let scheduled = stmt
                .query_map([], row_to_broadcast)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(scheduled)
        })
        .await
    }
}
