//! Worker Pool
//!
//! `max_workers` identical loops. Each iteration claims the oldest queued
//! job inside one transaction that also checks the instance cap, leases it,
//! commits, and only then launches the container. A failing job never takes
//! its loop down; it is expired and the loop moves on.

use crate::application::config::HarnessConfig;
use crate::application::jobs::expire_job;
use crate::application::registry::{ConnectionEvent, ConnectionHandle, ConnectionRegistry};
use crate::domain::entities::{Job, JobResponse, JobStatus, deadline_after};
use crate::domain::repository::{JobStore, JobTransaction};
use crate::domain::runtime::ContainerRuntime;
use crate::domain::value_objects::Port;
use crate::error::HarnessResult;
use chrono::{DateTime, Utc};
use kernel::id::JobId;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// What one claim attempt did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerTick {
    /// Instance cap reached; nothing claimed
    Saturated,
    /// No queued job available
    Idle,
    /// Claimed job had no port allocation and was expired
    MissingPort(JobId),
    /// Owning connection is gone; expired without launching
    Abandoned(JobId),
    Launched(JobId),
    /// Leased, but the container did not come up; expired
    LaunchFailed(JobId),
    /// Container came up after the job had already ended
    Cancelled(JobId),
}

impl WorkerTick {
    /// Whether the loop should go straight back to claiming
    pub fn did_work(&self) -> bool {
        !matches!(self, WorkerTick::Saturated | WorkerTick::Idle)
    }
}

pub struct WorkerPool<S, R>
where
    S: JobStore + 'static,
    R: ContainerRuntime + Sync + 'static,
{
    store: Arc<S>,
    runtime: Arc<R>,
    registry: ConnectionRegistry,
    config: Arc<HarnessConfig>,
}

impl<S, R> WorkerPool<S, R>
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

    /// Spawn `max_workers` loops
    pub fn spawn(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        (0..self.config.max_workers)
            .map(|worker| {
                let pool = Arc::clone(self);
                tokio::spawn(async move { pool.run(worker).await })
            })
            .collect()
    }

    pub async fn run(&self, worker: usize) {
        tracing::info!(worker, "Worker started");

        loop {
            match self.tick().await {
                Ok(tick) if tick.did_work() => {
                    tracing::debug!(worker, ?tick, "Worker finished job, looking for more");
                }
                Ok(_) => tokio::time::sleep(self.config.idle_poll).await,
                Err(e) => {
                    e.log();
                    tokio::time::sleep(self.config.idle_poll).await;
                }
            }
        }
    }

    /// One claim attempt; launches the claimed job before returning
    pub async fn tick(&self) -> HarnessResult<WorkerTick> {
        let mut tx = self.store.begin().await?;
        tx.lock_admission().await?;

        let running = tx.count_running().await?;
        if running >= self.config.max_instances {
            tx.rollback().await?;
            return Ok(WorkerTick::Saturated);
        }

        let Some(job) = tx.claim_oldest_queued().await? else {
            tx.rollback().await?;
            return Ok(WorkerTick::Idle);
        };

        let Some(port) = tx.port_for(job.id).await? else {
            tracing::error!(job_id = %job.id, "Queued job has no port allocation");
            tx.mark_expired_now(job.id).await?;
            tx.commit().await?;
            return Ok(WorkerTick::MissingPort(job.id));
        };

        let Some(connection) = self
            .registry
            .get(job.connection_id)
            .filter(|connection| connection.is_live())
        else {
            tracing::info!(job_id = %job.id, "Connection gone before launch, expiring job");
            tx.mark_expired_now(job.id).await?;
            tx.commit().await?;
            return Ok(WorkerTick::Abandoned(job.id));
        };

        let now = Utc::now();
        let lease_until = deadline_after(now, self.config.lease);
        tx.set_lease(job.id, lease_until).await?;
        tx.commit().await?;

        self.expire_on_disconnect(connection.clone(), job.id);

        let launch_at = deadline_after(now, self.config.launch_delay);
        match self
            .launch(&connection, &job, port, launch_at, lease_until)
            .await
        {
            Ok(tick) => Ok(tick),
            Err(e) => {
                e.log();
                if let Err(expire_err) = expire_job(self.store.as_ref(), job.id).await {
                    expire_err.log();
                }
                Ok(WorkerTick::LaunchFailed(job.id))
            }
        }
    }

    async fn launch(
        &self,
        connection: &ConnectionHandle,
        job: &Job,
        port: Port,
        launch_at: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> HarnessResult<WorkerTick> {
        tracing::info!(job_id = %job.id, port = port.get(), "Launching instance");

        connection.notify(ConnectionEvent::Accepted {
            job_id: job.id,
            response: JobResponse::for_port(&self.config.target_host, port),
            launch_at,
        });

        tokio::time::sleep(self.config.launch_delay).await;

        if !connection.is_live() {
            tracing::info!(job_id = %job.id, "Connection gone during launch delay");
            expire_job(self.store.as_ref(), job.id).await?;
            return Ok(WorkerTick::Abandoned(job.id));
        }

        self.runtime.up(job.id, port).await?;

        if !self.still_leased(job.id).await? {
            return Ok(WorkerTick::Cancelled(job.id));
        }

        connection.notify(ConnectionEvent::Processing {
            job_id: job.id,
            lease_until,
        });

        tracing::info!(job_id = %job.id, %lease_until, "Instance is up");
        Ok(WorkerTick::Launched(job.id))
    }

    /// Re-check the job after `up` under its row lock
    ///
    /// A job the reaper already completed has had its teardown run before the
    /// container existed, so it is torn down here. A job that is expired but
    /// not yet completed is left to the reaper.
    async fn still_leased(&self, job_id: JobId) -> HarnessResult<bool> {
        let mut tx = self.store.begin().await?;
        let status = tx
            .lock_job(job_id)
            .await?
            .map(|job| job.status_at(Utc::now()));
        tx.rollback().await?;

        match status {
            Some(JobStatus::Leased) => Ok(true),
            Some(JobStatus::Completed) | None => {
                tracing::info!(job_id = %job_id, "Job completed while starting, tearing down");
                if let Err(e) = self.runtime.down(job_id).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Late teardown failed");
                }
                Ok(false)
            }
            Some(status) => {
                tracing::info!(job_id = %job_id, ?status, "Job expired while starting");
                Ok(false)
            }
        }
    }

    /// Expire the job as soon as its connection drops
    ///
    /// The hook ends without touching the job once the reaper releases it.
    fn expire_on_disconnect(&self, connection: ConnectionHandle, job_id: JobId) {
        let store = Arc::clone(&self.store);
        let registry = self.registry.clone();
        let released = registry.watch_job(job_id);

        tokio::spawn(async move {
            tokio::select! {
                _ = connection.closed() => {
                    tracing::debug!(
                        job_id = %job_id,
                        connection_id = %connection.id(),
                        "Connection dropped"
                    );
                    registry.release_job(job_id);
                    if let Err(e) = expire_job(store.as_ref(), job_id).await {
                        e.log();
                    }
                }
                _ = released => {}
            }
        });
    }
}
