//! The two shared-store capabilities the scheduler coordinates through:
//! a time-ordered job queue with an atomic "pop everything due" and a
//! short-lived mutual-exclusion lock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::StoreError;

/// Name of the polling claim lock.
pub const LOCK_NAME: &str = "scheduler:lock";

/// A claimed or queued job: which broadcast, and when it fires (unix seconds).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub broadcast_id: String,
    pub fire_at: i64,
}

#[derive(Serialize, Deserialize)]
struct JobMember {
    id: String,
}

/// Queue member for a broadcast: `{"id":"<broadcast id>"}`.
pub fn encode_member(broadcast_id: &str) -> Result<String, StoreError> {
    Ok(serde_json::to_string(&JobMember {
        id: broadcast_id.to_string(),
    })?)
}

pub fn decode_member(member: &str) -> Result<String, StoreError> {
    Ok(serde_json::from_str::<JobMember>(member)?.id)
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert or move a broadcast's job to `fire_at`.
    async fn push(&self, broadcast_id: &str, fire_at: i64) -> Result<(), StoreError>;

    /// Returns true if the job was queued.
    async fn remove(&self, broadcast_id: &str) -> Result<bool, StoreError>;

    /// Atomically remove and return every job with `fire_at <= now`, oldest first.
    async fn pop_due(&self, now: i64) -> Result<Vec<ScheduledJob>, StoreError>;

    async fn len(&self) -> Result<usize, StoreError>;

    async fn fire_at(&self, broadcast_id: &str) -> Result<Option<i64>, StoreError>;
}

#[async_trait]
pub trait ClaimLock: Send + Sync {
    /// Take the lock unless another holder has it and it has not expired.
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Release the lock if `holder` still owns it.
    async fn release(&self, holder: &str) -> Result<(), StoreError>;
}

/// Process-local queue for single-instance deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryJobQueue {
    /// member -> fire_at
    jobs: Mutex<HashMap<String, i64>>,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn push(&self, broadcast_id: &str, fire_at: i64) -> Result<(), StoreError> {
        let member = encode_member(broadcast_id)?;
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(member, fire_at);
        Ok(())
    }

    async fn remove(&self, broadcast_id: &str) -> Result<bool, StoreError> {
        let member = encode_member(broadcast_id)?;
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&member)
            .is_some())
    }

    async fn pop_due(&self, now: i64) -> Result<Vec<ScheduledJob>, StoreError> {
        let due: Vec<(String, i64)> = {
            let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            let members: Vec<String> = jobs
                .iter()
                .filter(|(_, fire_at)| **fire_at <= now)
                .map(|(member, _)| member.clone())
                .collect();
            members
                .into_iter()
                .filter_map(|m| jobs.remove(&m).map(|at| (m, at)))
                .collect()
        };

        let mut claimed = due
            .into_iter()
            .map(|(member, fire_at)| {
                Ok(ScheduledJob {
                    broadcast_id: decode_member(&member)?,
                    fire_at,
                })
            })
            .collect::<Result<Vec<_>, StoreError>>()?;
        claimed.sort_by_key(|job| job.fire_at);
        Ok(claimed)
    }

    async fn len(&self) -> Result<usize, StoreError> {
        Ok(self.jobs.lock().unwrap_or_else(PoisonError::into_inner).len())
    }

    async fn fire_at(&self, broadcast_id: &str) -> Result<Option<i64>, StoreError> {
        let member = encode_member(broadcast_id)?;
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&member)
            .copied())
    }
}

/// Process-local claim lock. Expiry follows the tokio clock.
#[derive(Debug, Default)]
pub struct MemoryClaimLock {
    held: Mutex<Option<(String, Instant)>>,
}

impl MemoryClaimLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimLock for MemoryClaimLock {
    async fn try_acquire(&self, holder: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let free = match held.as_ref() {
            None => true,
            Some((owner, expires_at)) => owner == holder || *expires_at <= now,
        };
        if free {
            *held = Some((holder.to_string(), now + ttl));
        }
        Ok(free)
    }

    async fn release(&self, holder: &str) -> Result<(), StoreError> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if held.as_ref().is_some_and(|(owner, _)| owner == holder) {
            *held = None;
        }
        Ok(())
    }
}
