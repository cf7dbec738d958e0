//! Job Queue Helpers
//!
//! Short single-purpose transactions shared by sessions, workers and the
//! status endpoint.

use crate::domain::repository::{JobStore, JobTransaction};
use crate::error::HarnessResult;
use kernel::id::JobId;

/// Running and queued counts read in one transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub queued: u64,
    pub running: u64,
}

/// Make a job reap-eligible now
///
/// Returns `false` if the job was already completed.
pub async fn expire_job<S>(store: &S, job_id: JobId) -> HarnessResult<bool>
where
    S: JobStore,
{
    let mut tx = store.begin().await?;
    let expired = tx.mark_expired_now(job_id).await?;
    tx.commit().await?;

    if expired {
        tracing::info!(job_id = %job_id, "Job expired");
    }
    Ok(expired)
}

/// Queued jobs ahead of `job_id`
pub async fn queue_position<S>(store: &S, job_id: JobId) -> HarnessResult<u64>
where
    S: JobStore,
{
    let mut tx = store.begin().await?;
    let ahead = tx.count_queued_ahead(job_id).await?;
    tx.rollback().await?;
    Ok(ahead)
}

pub async fn queue_snapshot<S>(store: &S) -> HarnessResult<QueueSnapshot>
where
    S: JobStore,
{
    let mut tx = store.begin().await?;
    let queued = tx.count_queued().await?;
    let running = tx.count_running().await?;
    tx.rollback().await?;
    Ok(QueueSnapshot { queued, running })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::JobRequest;
    use crate::infra::memory::MemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_queue_position_counts_older_queued_jobs() {
        let store = MemoryJobStore::new();
        let first = store.seed_queued_job(JobRequest(json!(1)));
        let second = store.seed_queued_job(JobRequest(json!(2)));
        let third = store.seed_queued_job(JobRequest(json!(3)));

        assert_eq!(queue_position(&store, first).await.unwrap(), 0);
        assert_eq!(queue_position(&store, third).await.unwrap(), 2);

        expire_job(&store, first).await.unwrap();
        assert_eq!(queue_position(&store, second).await.unwrap(), 0);
        assert_eq!(queue_position(&store, third).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_snapshot_and_expiry() {
        let store = MemoryJobStore::new();
        let job_id = store.seed_queued_job(JobRequest(json!(null)));
        assert_eq!(
            queue_snapshot(&store).await.unwrap(),
            QueueSnapshot {
                queued: 1,
                running: 0
            }
        );

        assert!(expire_job(&store, job_id).await.unwrap());
        let job = store.job(job_id).unwrap();
        assert!(job.expires_at.is_some());
        assert!(!job.was_leased());
        assert_eq!(
            queue_snapshot(&store).await.unwrap(),
            QueueSnapshot {
                queued: 0,
                running: 1
            }
        );
    }
}
