//! Repository Traits
//!
//! Interfaces for job persistence. Implementations are in the infrastructure layer.
//!
//! All mutual exclusion over job rows lives in the store: claims lock the
//! returned row for the rest of the transaction and skip rows another open
//! transaction has already locked.

use crate::domain::entities::{Challenge, Job};
use crate::domain::value_objects::Port;
use crate::error::HarnessResult;
use chrono::{DateTime, Utc};
use kernel::id::{ChallengeId, JobId};
use std::future::Future;

/// Entry point to the durable job table
pub trait JobStore: Send + Sync {
    type Tx: JobTransaction + Send + 'static;

    /// Open a transaction. Dropping it without `commit` rolls it back.
    fn begin(&self) -> impl Future<Output = HarnessResult<Self::Tx>> + Send;
}

/// One open store transaction
#[trait_variant::make(JobTransaction: Send)]
pub trait LocalJobTransaction {
    /// Serialise instance-cap decisions until this transaction ends
    async fn lock_admission(&mut self) -> HarnessResult<()>;

    /// Jobs holding a lease that are not completed (reap-eligible included)
    async fn count_running(&mut self) -> HarnessResult<u64>;

    async fn count_queued(&mut self) -> HarnessResult<u64>;

    /// Queued jobs created before `job_id`
    async fn count_queued_ahead(&mut self, job_id: JobId) -> HarnessResult<u64>;

    /// Lock and return the oldest queued job, skipping locked rows
    async fn claim_oldest_queued(&mut self) -> HarnessResult<Option<Job>>;

    /// Lock and return the oldest reap-eligible job, skipping locked rows
    async fn claim_oldest_expired(&mut self) -> HarnessResult<Option<Job>>;

    /// Lock and read one job, waiting for any transaction holding it
    async fn lock_job(&mut self, job_id: JobId) -> HarnessResult<Option<Job>>;

    async fn port_for(&mut self, job_id: JobId) -> HarnessResult<Option<Port>>;

    /// Set `expires_at` and, on first lease, `leased_at`
    async fn set_lease(&mut self, job_id: JobId, until: DateTime<Utc>) -> HarnessResult<()>;

    /// Make a non-completed job reap-eligible immediately
    ///
    /// Returns `false` when the job is unknown or already completed.
    async fn mark_expired_now(&mut self, job_id: JobId) -> HarnessResult<bool>;

    /// Terminal transition; a completed job is left untouched
    async fn mark_completed(&mut self, job_id: JobId) -> HarnessResult<()>;

    async fn insert_challenge(&mut self, challenge: &Challenge) -> HarnessResult<()>;

    /// Lock and read a challenge row, waiting for concurrent validators
    async fn lock_challenge(&mut self, id: ChallengeId) -> HarnessResult<Option<Challenge>>;

    async fn delete_challenge(&mut self, id: ChallengeId) -> HarnessResult<()>;

    /// Delete challenges whose deadline is not after `now`
    async fn delete_expired_challenges(&mut self, now: DateTime<Utc>) -> HarnessResult<u64>;

    /// Reserve `port` for this transaction if no live job holds it and no
    /// other open transaction has reserved it
    async fn try_reserve_port(&mut self, port: Port) -> HarnessResult<bool>;

    async fn insert_job(&mut self, job: &Job) -> HarnessResult<()>;

    async fn insert_port(&mut self, job_id: JobId, port: Port) -> HarnessResult<()>;

    async fn commit(self) -> HarnessResult<()>;

    async fn rollback(self) -> HarnessResult<()>;
}
