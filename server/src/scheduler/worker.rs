use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::queue::ScheduledJob;
use crate::broadcasts::pipeline::SendPipeline;
use crate::broadcasts::repository::BroadcastRepository;
use crate::broadcasts::BroadcastStatus;
use crate::error::SchedulerError;

/// What a worker did with one claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Sent { delivered: usize },
    Failed(String),
    /// Broadcast already left `scheduled` (cancelled, or claimed by another worker).
    Skipped(BroadcastStatus),
    /// No broadcast record for the job.
    Missing,
    /// The fan-out ran but the record was no longer `sending` when it finished.
    Unrecorded { delivered: usize },
}

/// Run one job to a final state. Store errors are returned for logging; the
/// pipeline's own failures are recorded on the broadcast instead.
///
/// `begin_send` is the claim: only the worker that moves the record out of
/// `scheduled` runs the pipeline, however many queue entries point at it.
pub async fn process_job(
    job: &ScheduledJob,
    repo: &dyn BroadcastRepository,
    pipeline: &dyn SendPipeline,
) -> Result<JobOutcome, SchedulerError> {
    if !repo.begin_send(&job.broadcast_id).await? {
        return Ok(match repo.status(&job.broadcast_id).await? {
            Some(status) => JobOutcome::Skipped(status),
            None => JobOutcome::Missing,
        });
    }

    let broadcast = repo.get(&job.broadcast_id).await?;
    match pipeline.send(&broadcast).await {
        Ok(report) => {
            if repo.mark_sent(&broadcast.id, Utc::now().timestamp()).await? {
                Ok(JobOutcome::Sent {
                    delivered: report.delivered,
                })
            } else {
                Ok(JobOutcome::Unrecorded {
                    delivered: report.delivered,
                })
            }
        }
        Err(e) => {
            let reason = e.to_string();
            if !repo.mark_failed(&broadcast.id, &reason).await? {
                tracing::warn!(broadcast_id = %broadcast.id, "Failed broadcast left sending before it was recorded");
            }
            Ok(JobOutcome::Failed(reason))
        }
    }
}

/// Worker loop: pull jobs off the shared receiver until the channel closes.
pub(crate) async fn run_worker(
    worker_id: usize,
    jobs: Arc<Mutex<mpsc::Receiver<ScheduledJob>>>,
    repo: Arc<dyn BroadcastRepository>,
    pipeline: Arc<dyn SendPipeline>,
) {
    loop {
        // Hold the receiver only while waiting, not while processing.
        let job = { jobs.lock().await.recv().await };
        let Some(job) = job else {
            break;
        };

        match process_job(&job, repo.as_ref(), pipeline.as_ref()).await {
            Ok(JobOutcome::Sent { delivered }) => {
                tracing::info!(broadcast_id = %job.broadcast_id, delivered, "Broadcast sent");
            }
            Ok(JobOutcome::Failed(reason)) => {
                tracing::warn!(broadcast_id = %job.broadcast_id, reason = %reason, "Broadcast failed");
            }
            Ok(JobOutcome::Skipped(status)) => {
                tracing::debug!(
                    broadcast_id = %job.broadcast_id,
                    status = status.as_str(),
                    "Skipping broadcast no longer scheduled"
                );
            }
            Ok(JobOutcome::Missing) => {
                tracing::warn!(broadcast_id = %job.broadcast_id, "Queued broadcast has no record");
            }
            Ok(JobOutcome::Unrecorded { delivered }) => {
                tracing::error!(
                    broadcast_id = %job.broadcast_id,
                    delivered,
                    "Broadcast delivered but its record was no longer sending"
                );
            }
            Err(e) => {
                tracing::error!(broadcast_id = %job.broadcast_id, error = %e, "Broadcast job errored");
            }
        }
    }
    tracing::debug!(worker_id, "Broadcast worker stopped");
}
