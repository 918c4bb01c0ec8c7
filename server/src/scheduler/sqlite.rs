use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use std::time::Duration;

use super::queue::{decode_member, encode_member, ClaimLock, JobQueue, ScheduledJob, LOCK_NAME};
use crate::db::{with_conn, DbPool};
use crate::error::StoreError;

/// Job queue on the `schedule_queue` table. `pop_due` runs in an IMMEDIATE
/// transaction, so concurrent pollers on the same database file never claim
/// the same row.
#[derive(Clone)]
pub struct SqliteJobQueue {
    db: DbPool,
}

impl SqliteJobQueue {
    pub fn new(db: DbPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn push(&self, broadcast_id: &str, fire_at: i64) -> Result<(), StoreError> {
        let member = encode_member(broadcast_id)?;
        with_conn(&self.db, move |conn| {
            conn.execute(
                "INSERT INTO schedule_queue (member, fire_at) VALUES (?1, ?2)
                 ON CONFLICT(member) DO UPDATE SET fire_at = excluded.fire_at",
                params![member, fire_at],
            )?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, broadcast_id: &str) -> Result<bool, StoreError> {
        let member = encode_member(broadcast_id)?;
        with_conn(&self.db, move |conn| {
            let removed = conn.execute("DELETE FROM schedule_queue WHERE member = ?1", params![member])?;
            Ok(removed > 0)
        })
        .await
    }

    async fn pop_due(&self, now: i64) -> Result<Vec<ScheduledJob>, StoreError> {
        let rows = with_conn(&self.db, move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let rows = {
                let mut stmt = tx.prepare(
                    "SELECT member, fire_at FROM schedule_queue WHERE fire_at <= ?1 ORDER BY fire_at",
                )?;
                let rows = stmt
                    .query_map(params![now], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                rows
            };
            tx.execute("DELETE FROM schedule_queue WHERE fire_at <= ?1", params![now])?;
            tx.commit()?;
            Ok(rows)
        })
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for (member, fire_at) in rows {
            match decode_member(&member) {
                Ok(broadcast_id) => jobs.push(ScheduledJob {
                    broadcast_id,
                    fire_at,
                }),
                Err(e) => {
                    tracing::error!(member = %member, error = %e, "Dropping undecodable queue member");
                }
            }
        }
        Ok(jobs)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        with_conn(&self.db, move |conn| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM schedule_queue", [], |row| row.get(0))?;
            Ok(count as usize)
        })
        .await
    }

    async fn fire_at(&self, broadcast_id: &str) -> Result<Option<i64>, StoreError> {
        let member = encode_member(broadcast_id)?;
        with_conn(&self.db, move |conn| {
            Ok(conn
                .query_row(
                    "SELECT fire_at FROM schedule_queue WHERE member = ?1",
                    params![member],
                    |row| row.get(0),
                )
                .optional()?)
        })
        .await
    }
}

/// Insert-if-absent lock with a wall-clock expiry on `scheduler_locks`.
#[derive(Clone)]
pub struct SqliteClaimLock {
    db: DbPool,
    name: String,
}

impl SqliteClaimLock {
    pub fn new(db: DbPool) -> Self {
        Self::named(db, LOCK_NAME)
    }

    pub fn named(db: DbPool, name: &str) -> Self {
        Self {
            db,
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ClaimLock for SqliteClaimLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let name = self.name.clone();
        let holder = holder.to_string();
        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl.as_millis() as i64;
        with_conn(&self.db, move |conn| {
            // The upsert only fires when the current row is expired or ours,
            // so one statement decides ownership.
            let changed = conn.execute(
                "INSERT INTO scheduler_locks (name, holder, expires_at_ms) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET holder = excluded.holder, expires_at_ms = excluded.expires_at_ms
                 WHERE scheduler_locks.expires_at_ms <= ?4 OR scheduler_locks.holder = excluded.holder",
                params![name, holder, expires_at, now],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        let name = self.name.clone();
        let holder = holder.to_string();
        with_conn(&self.db, move |conn| {
            conn.execute(
                "DELETE FROM scheduler_locks WHERE name = ?1 AND holder = ?2",
                params![name, holder],
            )?;
            Ok(())
        })
        .await
    }
}
