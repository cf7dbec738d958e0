//! In-Memory Job Store
//!
//! Process-local store with the same transactional contract as Postgres:
//! - claims take a per-row lock and skip rows another transaction holds
//! - updates to a row wait for its lock
//! - writes are buffered and applied on commit; readers see committed state
//! - port reservations and the admission lock live until the transaction ends
//!
//! Used by tests and by the server when no database is configured.

use crate::domain::entities::{Challenge, Job, JobRequest};
use crate::domain::repository::{JobStore, JobTransaction};
use crate::domain::value_objects::Port;
use crate::error::HarnessResult;
use chrono::{DateTime, Utc};
use kernel::id::{ChallengeId, ConnectionId, JobId};
use std::collections::{HashMap, HashSet};
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, OwnedMutexGuard};
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    /// Sorted by `created_at`
    jobs: Vec<Job>,
    ports: HashMap<JobId, Port>,
    challenges: HashMap<ChallengeId, Challenge>,
    row_locks: HashSet<Uuid>,
    reserved_ports: HashSet<Port>,
}

impl Tables {
    fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs.iter().find(|job| job.id == id)
    }

    fn job_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.iter_mut().find(|job| job.id == id)
    }

    fn claim_first<F>(&mut self, predicate: F) -> Option<Job>
    where
        F: Fn(&Job) -> bool,
    {
        let job = self
            .jobs
            .iter()
            .find(|job| predicate(*job) && !self.row_locks.contains(job.id.as_uuid()))?
            .clone();
        self.row_locks.insert(job.id.into_uuid());
        Some(job)
    }

    fn insert_job(&mut self, job: Job) {
        let at = self
            .jobs
            .partition_point(|existing| existing.created_at <= job.created_at);
        self.jobs.insert(at, job);
    }

    fn port_in_use(&self, port: Port) -> bool {
        self.ports
            .iter()
            .filter(|(_, held)| **held == port)
            .any(|(job_id, _)| self.job(*job_id).is_some_and(|job| job.completed_at.is_none()))
    }
}

#[derive(Default)]
struct Shared {
    tables: Mutex<Tables>,
    /// Signalled whenever row locks are released
    released: Notify,
    admission: Arc<tokio::sync::Mutex<()>>,
}

impl Shared {
    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

enum Write {
    InsertJob(Job),
    InsertPort(JobId, Port),
    InsertChallenge(Challenge),
    DeleteChallenge(ChallengeId),
    DeleteExpiredChallenges(DateTime<Utc>),
    SetLease(JobId, DateTime<Utc>, DateTime<Utc>),
    ExpireNow(JobId, DateTime<Utc>),
    Complete(JobId, DateTime<Utc>),
}

/// In-memory job store
#[derive(Clone, Default)]
pub struct MemoryJobStore {
    shared: Arc<Shared>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Committed copy of every job, oldest first
    pub fn jobs(&self) -> Vec<Job> {
        self.shared.tables().jobs.clone()
    }

    pub fn job(&self, id: JobId) -> Option<Job> {
        self.shared.tables().job(id).cloned()
    }

    pub fn port_of(&self, id: JobId) -> Option<Port> {
        self.shared.tables().ports.get(&id).copied()
    }

    pub fn challenge_count(&self) -> usize {
        self.shared.tables().challenges.len()
    }

    /// Insert a committed queued job with no port allocation
    pub fn seed_queued_job(&self, request: JobRequest) -> JobId {
        let job = Job::new(request, ConnectionId::new());
        let id = job.id;
        self.shared.tables().insert_job(job);
        id
    }
}

impl JobStore for MemoryJobStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> HarnessResult<MemoryTransaction> {
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            locks: Vec::new(),
            reserved: Vec::new(),
            writes: Vec::new(),
            admission: None,
        })
    }
}

/// Open in-memory transaction; dropping it discards writes and releases locks
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    locks: Vec<Uuid>,
    reserved: Vec<Port>,
    writes: Vec<Write>,
    admission: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    /// Take the row lock on `row`, waiting while another transaction holds it
    async fn lock_row(&mut self, row: Uuid) {
        if self.locks.contains(&row) {
            return;
        }

        loop {
            let mut released = pin!(self.shared.released.notified());
            released.as_mut().enable();

            if self.shared.tables().row_locks.insert(row) {
                self.locks.push(row);
                return;
            }

            released.await;
        }
    }

    fn pending_completion(&self, job_id: JobId) -> bool {
        self.writes
            .iter()
            .any(|write| matches!(write, Write::Complete(id, _) if *id == job_id))
    }

    fn release(&mut self) {
        let locks = std::mem::take(&mut self.locks);
        let reserved = std::mem::take(&mut self.reserved);
        self.writes.clear();
        self.admission = None;

        if locks.is_empty() && reserved.is_empty() {
            return;
        }

        {
            let mut tables = self.shared.tables();
            for row in &locks {
                tables.row_locks.remove(row);
            }
            for port in &reserved {
                tables.reserved_ports.remove(port);
            }
        }
        self.shared.released.notify_waiters();
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        self.release();
    }
}

impl JobTransaction for MemoryTransaction {
    async fn lock_admission(&mut self) -> HarnessResult<()> {
        if self.admission.is_none() {
            let guard = Arc::clone(&self.shared.admission).lock_owned().await;
            self.admission = Some(guard);
        }
        Ok(())
    }

    async fn count_running(&mut self) -> HarnessResult<u64> {
        let tables = self.shared.tables();
        Ok(tables.jobs.iter().filter(|job| job.is_running()).count() as u64)
    }

    async fn count_queued(&mut self) -> HarnessResult<u64> {
        let tables = self.shared.tables();
        Ok(tables.jobs.iter().filter(|job| job.is_queued()).count() as u64)
    }

    async fn count_queued_ahead(&mut self, job_id: JobId) -> HarnessResult<u64> {
        let tables = self.shared.tables();
        let ahead = tables
            .jobs
            .iter()
            .take_while(|job| job.id != job_id)
            .filter(|job| job.is_queued())
            .count();
        // unknown job: nothing is ahead of it
        if tables.job(job_id).is_none() {
            return Ok(0);
        }
        Ok(ahead as u64)
    }

    async fn claim_oldest_queued(&mut self) -> HarnessResult<Option<Job>> {
        let claimed = self.shared.tables().claim_first(Job::is_queued);
        if let Some(job) = &claimed {
            self.locks.push(job.id.into_uuid());
        }
        Ok(claimed)
    }

    async fn claim_oldest_expired(&mut self) -> HarnessResult<Option<Job>> {
        let now = Utc::now();
        let claimed = self.shared.tables().claim_first(|job| {
            job.completed_at.is_none() && job.expires_at.is_some_and(|at| at <= now)
        });
        if let Some(job) = &claimed {
            self.locks.push(job.id.into_uuid());
        }
        Ok(claimed)
    }

    async fn lock_job(&mut self, job_id: JobId) -> HarnessResult<Option<Job>> {
        self.lock_row(job_id.into_uuid()).await;
        Ok(self.shared.tables().job(job_id).cloned())
    }

    async fn port_for(&mut self, job_id: JobId) -> HarnessResult<Option<Port>> {
        Ok(self.shared.tables().ports.get(&job_id).copied())
    }

    async fn set_lease(&mut self, job_id: JobId, until: DateTime<Utc>) -> HarnessResult<()> {
        self.lock_row(job_id.into_uuid()).await;
        self.writes.push(Write::SetLease(job_id, until, Utc::now()));
        Ok(())
    }

    async fn mark_expired_now(&mut self, job_id: JobId) -> HarnessResult<bool> {
        self.lock_row(job_id.into_uuid()).await;
        let open = self
            .shared
            .tables()
            .job(job_id)
            .is_some_and(|job| job.completed_at.is_none());
        if !open || self.pending_completion(job_id) {
            return Ok(false);
        }
        self.writes.push(Write::ExpireNow(job_id, Utc::now()));
        Ok(true)
    }

    async fn mark_completed(&mut self, job_id: JobId) -> HarnessResult<()> {
        self.lock_row(job_id.into_uuid()).await;
        self.writes.push(Write::Complete(job_id, Utc::now()));
        Ok(())
    }

    async fn insert_challenge(&mut self, challenge: &Challenge) -> HarnessResult<()> {
        self.writes.push(Write::InsertChallenge(challenge.clone()));
        Ok(())
    }

    async fn lock_challenge(&mut self, id: ChallengeId) -> HarnessResult<Option<Challenge>> {
        self.lock_row(id.into_uuid()).await;
        Ok(self.shared.tables().challenges.get(&id).cloned())
    }

    async fn delete_challenge(&mut self, id: ChallengeId) -> HarnessResult<()> {
        self.lock_row(id.into_uuid()).await;
        self.writes.push(Write::DeleteChallenge(id));
        Ok(())
    }

    async fn delete_expired_challenges(&mut self, now: DateTime<Utc>) -> HarnessResult<u64> {
        let expired = self
            .shared
            .tables()
            .challenges
            .values()
            .filter(|challenge| challenge.deadline <= now)
            .count();
        self.writes.push(Write::DeleteExpiredChallenges(now));
        Ok(expired as u64)
    }

    async fn try_reserve_port(&mut self, port: Port) -> HarnessResult<bool> {
        let mut tables = self.shared.tables();
        if tables.reserved_ports.contains(&port) || tables.port_in_use(port) {
            return Ok(false);
        }
        tables.reserved_ports.insert(port);
        drop(tables);

        self.reserved.push(port);
        Ok(true)
    }

    async fn insert_job(&mut self, job: &Job) -> HarnessResult<()> {
        self.writes.push(Write::InsertJob(job.clone()));
        Ok(())
    }

    async fn insert_port(&mut self, job_id: JobId, port: Port) -> HarnessResult<()> {
        self.writes.push(Write::InsertPort(job_id, port));
        Ok(())
    }

    async fn commit(mut self) -> HarnessResult<()> {
        let writes = std::mem::take(&mut self.writes);
        {
            let mut tables = self.shared.tables();
            for write in writes {
                apply(&mut tables, write);
            }
        }
        self.release();
        Ok(())
    }

    async fn rollback(mut self) -> HarnessResult<()> {
        self.release();
        Ok(())
    }
}

fn apply(tables: &mut Tables, write: Write) {
    match write {
        Write::InsertJob(job) => tables.insert_job(job),
        Write::InsertPort(job_id, port) => {
            tables.ports.insert(job_id, port);
        }
        Write::InsertChallenge(challenge) => {
            tables.challenges.insert(challenge.id, challenge);
        }
        Write::DeleteChallenge(id) => {
            tables.challenges.remove(&id);
        }
        Write::DeleteExpiredChallenges(now) => {
            tables.challenges.retain(|_, challenge| challenge.deadline > now);
        }
        Write::SetLease(job_id, until, now) => {
            if let Some(job) = tables.job_mut(job_id).filter(|job| job.completed_at.is_none()) {
                job.expires_at = Some(until);
                job.leased_at.get_or_insert(now);
            }
        }
        Write::ExpireNow(job_id, now) => {
            if let Some(job) = tables.job_mut(job_id).filter(|job| job.completed_at.is_none()) {
                job.expires_at = Some(now);
            }
        }
        Write::Complete(job_id, now) => {
            if let Some(job) = tables.job_mut(job_id).filter(|job| job.completed_at.is_none()) {
                job.completed_at = Some(now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::Difficulty;
    use chrono::TimeDelta;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_claims_skip_locked_rows() {
        let store = MemoryJobStore::new();
        let first = store.seed_queued_job(JobRequest(json!(1)));
        let second = store.seed_queued_job(JobRequest(json!(2)));

        let mut a = store.begin().await.unwrap();
        let mut b = store.begin().await.unwrap();
        let mut c = store.begin().await.unwrap();

        assert_eq!(a.claim_oldest_queued().await.unwrap().unwrap().id, first);
        assert_eq!(b.claim_oldest_queued().await.unwrap().unwrap().id, second);
        assert!(c.claim_oldest_queued().await.unwrap().is_none());

        drop(a);
        assert_eq!(c.claim_oldest_queued().await.unwrap().unwrap().id, first);
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryJobStore::new();
        let job = Job::new(JobRequest(json!(null)), ConnectionId::new());

        let mut tx = store.begin().await.unwrap();
        tx.insert_job(&job).await.unwrap();
        assert!(store.jobs().is_empty());

        tx.commit().await.unwrap();
        assert_eq!(store.jobs().len(), 1);

        let mut tx = store.begin().await.unwrap();
        tx.mark_completed(job.id).await.unwrap();
        tx.rollback().await.unwrap();
        assert!(store.job(job.id).unwrap().completed_at.is_none());
    }

    #[tokio::test]
    async fn test_update_waits_for_row_lock() {
        let store = MemoryJobStore::new();
        let job_id = store.seed_queued_job(JobRequest(json!(null)));

        let mut claimer = store.begin().await.unwrap();
        claimer.claim_oldest_queued().await.unwrap().unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                let expired = tx.mark_expired_now(job_id).await.unwrap();
                tx.commit().await.unwrap();
                expired
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        let until = Utc::now() + TimeDelta::minutes(15);
        claimer.set_lease(job_id, until).await.unwrap();
        claimer.commit().await.unwrap();

        assert!(waiter.await.unwrap());
        let job = store.job(job_id).unwrap();
        assert!(job.was_leased());
        assert!(job.expires_at.unwrap() < until);
    }

    #[tokio::test]
    async fn test_completed_jobs_are_terminal() {
        let store = MemoryJobStore::new();
        let job_id = store.seed_queued_job(JobRequest(json!(null)));

        let mut tx = store.begin().await.unwrap();
        assert!(tx.mark_expired_now(job_id).await.unwrap());
        tx.mark_completed(job_id).await.unwrap();
        assert!(!tx.mark_expired_now(job_id).await.unwrap());
        tx.commit().await.unwrap();

        let completed_at = store.job(job_id).unwrap().completed_at;
        assert!(completed_at.is_some());

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.mark_expired_now(job_id).await.unwrap());
        tx.mark_completed(job_id).await.unwrap();
        tx.commit().await.unwrap();
        assert_eq!(store.job(job_id).unwrap().completed_at, completed_at);
    }

    #[tokio::test]
    async fn test_claim_oldest_expired() {
        let store = MemoryJobStore::new();
        let leased = store.seed_queued_job(JobRequest(json!(1)));
        let expired = store.seed_queued_job(JobRequest(json!(2)));

        let mut tx = store.begin().await.unwrap();
        tx.set_lease(leased, Utc::now() + TimeDelta::minutes(15))
            .await
            .unwrap();
        tx.mark_expired_now(expired).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_running().await.unwrap(), 2);
        assert_eq!(tx.claim_oldest_expired().await.unwrap().unwrap().id, expired);
        assert!(tx.claim_oldest_expired().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queue_follows_creation_time_not_commit_order() {
        let store = MemoryJobStore::new();
        let older = Job::new(JobRequest(json!("older")), ConnectionId::new());
        let mut newer = Job::new(JobRequest(json!("newer")), ConnectionId::new());
        newer.created_at = older.created_at + TimeDelta::milliseconds(5);

        let mut slow = store.begin().await.unwrap();
        let mut fast = store.begin().await.unwrap();
        slow.insert_job(&older).await.unwrap();
        fast.insert_job(&newer).await.unwrap();
        fast.commit().await.unwrap();
        slow.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.count_queued_ahead(newer.id).await.unwrap(), 1);
        assert_eq!(tx.count_queued_ahead(older.id).await.unwrap(), 0);
        assert_eq!(tx.claim_oldest_queued().await.unwrap().unwrap().id, older.id);
    }

    #[tokio::test]
    async fn test_lock_job_waits_for_claimer() {
        let store = MemoryJobStore::new();
        let job_id = store.seed_queued_job(JobRequest(json!(null)));

        let mut claimer = store.begin().await.unwrap();
        claimer.claim_oldest_queued().await.unwrap().unwrap();

        let reader = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                tx.lock_job(job_id).await.unwrap().unwrap()
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!reader.is_finished());

        claimer.mark_completed(job_id).await.unwrap();
        claimer.commit().await.unwrap();
        assert!(reader.await.unwrap().completed_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_expired_challenges() {
        let store = MemoryJobStore::new();
        let stale = Challenge::new("aa".into(), Difficulty::default(), Duration::ZERO);
        let live = Challenge::new("bb".into(), Difficulty::default(), Duration::from_secs(300));

        let mut tx = store.begin().await.unwrap();
        tx.insert_challenge(&stale).await.unwrap();
        tx.insert_challenge(&live).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert_eq!(tx.delete_expired_challenges(Utc::now()).await.unwrap(), 1);
        assert_eq!(store.challenge_count(), 2);
        tx.commit().await.unwrap();
        assert_eq!(store.challenge_count(), 1);
    }

    #[tokio::test]
    async fn test_admission_lock_is_exclusive() {
        let store = MemoryJobStore::new();
        let mut holder = store.begin().await.unwrap();
        holder.lock_admission().await.unwrap();

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut tx = store.begin().await.unwrap();
                tx.lock_admission().await.unwrap();
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        holder.rollback().await.unwrap();
        contender.await.unwrap();
    }
}
