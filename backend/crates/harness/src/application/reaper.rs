//! Reaper
//!
//! Single loop that completes reap-eligible jobs. The container is torn down
//! (if one was ever launched) and the job marked completed inside the
//! transaction that claimed it; the owning connection is told afterwards.
//! When nothing is reap-eligible the same transaction sweeps expired
//! challenges instead.

use crate::application::config::HarnessConfig;
use crate::application::registry::{ConnectionEvent, ConnectionRegistry};
use crate::domain::repository::{JobStore, JobTransaction};
use crate::domain::runtime::ContainerRuntime;
use crate::error::HarnessResult;
use chrono::Utc;
use kernel::id::JobId;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReapTick {
    Idle,
    Reaped { job_id: JobId, torn_down: bool },
}

pub struct Reaper<S, R>
where
    S: JobStore + 'static,
    R: ContainerRuntime + Sync + 'static,
{
    store: Arc<S>,
    runtime: Arc<R>,
    registry: ConnectionRegistry,
    config: Arc<HarnessConfig>,
}

impl<S, R> Reaper<S, R>
where
    S: JobStore + 'static,
    R: ContainerRuntime + Sync + 'static,
{
    pub fn new(
        store: Arc<S>,
        runtime: Arc<R>,
        registry: ConnectionRegistry,
        config: Arc<HarnessConfig>,
    ) -> Self {
        Self {
            store,
            runtime,
            registry,
            config,
        }
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = Arc::clone(self);
        tokio::spawn(async move { reaper.run().await })
    }

    pub async fn run(&self) {
        tracing::info!("Reaper started");

        loop {
            match self.tick().await {
                Ok(ReapTick::Reaped { .. }) => {}
                Ok(ReapTick::Idle) => tokio::time::sleep(self.config.idle_poll).await,
                Err(e) => {
                    e.log();
                    tokio::time::sleep(self.config.idle_poll).await;
                }
            }
        }
    }

    pub async fn tick(&self) -> HarnessResult<ReapTick> {
        let mut tx = self.store.begin().await?;

        let Some(job) = tx.claim_oldest_expired().await? else {
            let swept = tx.delete_expired_challenges(Utc::now()).await?;
            tx.commit().await?;
            if swept > 0 {
                tracing::info!(challenges = swept, "Swept expired challenges");
            }
            return Ok(ReapTick::Idle);
        };

        let connection = self.registry.get(job.connection_id);

        let torn_down = if job.was_leased() {
            match self.runtime.down(job.id).await {
                Ok(()) => true,
                Err(e) => {
                    // container may already be gone
                    tracing::debug!(job_id = %job.id, error = %e, "Teardown failed, completing anyway");
                    false
                }
            }
        } else {
            false
        };

        tx.mark_completed(job.id).await?;
        tx.commit().await?;
        self.registry.release_job(job.id);

        if let Some(connection) = connection {
            connection.notify(ConnectionEvent::Done { job_id: job.id });
        }

        tracing::info!(job_id = %job.id, torn_down, "Job reaped");
        Ok(ReapTick::Reaped {
            job_id: job.id,
            torn_down,
        })
    }
}
