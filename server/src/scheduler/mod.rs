//! Delayed broadcast delivery.
//!
//! Jobs live in a shared [`JobQueue`] keyed by fire time. Every tick the
//! poller takes the [`ClaimLock`], pops everything due, releases the lock and
//! hands the jobs to a fixed worker pool. Claiming by removal is what makes a
//! job fire once even with several server instances polling the same store.

pub mod queue;
pub mod sqlite;
pub mod worker;

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::broadcasts::pipeline::SendPipeline;
use crate::broadcasts::repository::BroadcastRepository;
use crate::config::SchedulerSettings;
use crate::error::SchedulerError;
use queue::{ClaimLock, JobQueue, ScheduledJob};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    /// No pending job: never scheduled, already claimed, or already cancelled.
    NotScheduled,
}

/// Result of handing one claimed job to the worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handed,
    /// Every worker slot was busy; the job went back on the queue.
    Requeued { retry_at: i64 },
}

pub struct BroadcastScheduler {
    queue: Arc<dyn JobQueue>,
    lock: Arc<dyn ClaimLock>,
    repo: Arc<dyn BroadcastRepository>,
    pipeline: Arc<dyn SendPipeline>,
    settings: SchedulerSettings,
    instance_id: String,
}

impl BroadcastScheduler {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        lock: Arc<dyn ClaimLock>,
        repo: Arc<dyn BroadcastRepository>,
        pipeline: Arc<dyn SendPipeline>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            queue,
            lock,
            repo,
            pipeline,
            settings,
            instance_id: uuid::Uuid::now_v7().to_string(),
        }
    }

    /// Lock holder identity of this process.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn queue(&self) -> &Arc<dyn JobQueue> {
        &self.queue
    }

    /// Queue (or move) a broadcast to fire at `fire_at` unix seconds.
    pub async fn schedule(&self, broadcast_id: &str, fire_at: i64) -> Result<(), SchedulerError> {
        self.queue.push(broadcast_id, fire_at).await?;
        tracing::debug!(broadcast_id, fire_at, "Broadcast scheduled");
        Ok(())
    }

    pub async fn cancel(&self, broadcast_id: &str) -> Result<CancelOutcome, SchedulerError> {
        if self.queue.remove(broadcast_id).await? {
            tracing::info!(broadcast_id, "Broadcast cancelled");
            Ok(CancelOutcome::Cancelled)
        } else {
            Ok(CancelOutcome::NotScheduled)
        }
    }

    /// Re-queue every persisted `scheduled` broadcast. Past-due ones keep their
    /// original time, so the next poll fires them.
    pub async fn reload_scheduled(&self) -> Result<usize, SchedulerError> {
        let scheduled = self.repo.list_scheduled().await?;
        for broadcast in &scheduled {
            self.queue.push(&broadcast.id, broadcast.scheduled_at).await?;
        }
        if !scheduled.is_empty() {
            tracing::info!(count = scheduled.len(), "Reloaded scheduled broadcasts");
        }
        Ok(scheduled.len())
    }

    /// Claim every job due at `now`. Returns nothing when another instance
    /// holds the lock.
    pub async fn claim_due(&self, now: i64) -> Result<Vec<ScheduledJob>, SchedulerError> {
        if !self
            .lock
            .try_acquire(&self.instance_id, self.settings.lock_ttl())
            .await?
        {
            return Ok(Vec::new());
        }

        let popped = self.queue.pop_due(now).await;
        if let Err(e) = self.lock.release(&self.instance_id).await {
            // Expiry frees it anyway
            tracing::warn!(error = %e, "Failed to release scheduler lock");
        }
        Ok(popped?)
    }

    pub async fn dispatch(
        &self,
        jobs: &mpsc::Sender<ScheduledJob>,
        job: ScheduledJob,
    ) -> Result<Dispatch, SchedulerError> {
        match jobs.try_send(job) {
            Ok(()) => Ok(Dispatch::Handed),
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => {
                let retry_at = Utc::now().timestamp() + self.settings.requeue_delay().as_secs() as i64;
                self.queue.push(&job.broadcast_id, retry_at).await?;
                tracing::warn!(
                    broadcast_id = %job.broadcast_id,
                    retry_at,
                    "Broadcast workers saturated, job requeued"
                );
                Ok(Dispatch::Requeued { retry_at })
            }
        }
    }

    /// One poller tick. Returns how many jobs reached a worker.
    pub async fn poll_once(&self, jobs: &mpsc::Sender<ScheduledJob>) -> usize {
        let claimed = match self.claim_due(Utc::now().timestamp()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::warn!(error = %e, "Scheduler tick skipped");
                return 0;
            }
        };

        let mut handed = 0;
        for job in claimed {
            let broadcast_id = job.broadcast_id.clone();
            match self.dispatch(jobs, job).await {
                Ok(Dispatch::Handed) => handed += 1,
                Ok(Dispatch::Requeued { .. }) => {}
                Err(e) => {
                    // Still `scheduled` in the repository; startup reconciliation recovers it.
                    tracing::error!(broadcast_id = %broadcast_id, error = %e, "Failed to requeue broadcast");
                }
            }
        }
        handed
    }

    /// Poll until `shutdown` fires, then close the job channel and wait for the
    /// workers to finish what they hold.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let (tx, rx) = mpsc::channel(self.settings.job_channel_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.settings.workers.max(1) {
            workers.spawn(worker::run_worker(
                worker_id,
                rx.clone(),
                self.repo.clone(),
                self.pipeline.clone(),
            ));
        }

        tracing::info!(
            instance_id = %self.instance_id,
            workers = self.settings.workers,
            "Broadcast scheduler started"
        );

        let mut ticker = tokio::time::interval(self.settings.poll_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_once(&tx).await;
                }
            }
        }

        drop(tx);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Broadcast worker panicked");
            }
        }
        tracing::info!("Broadcast scheduler stopped");
    }

    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
