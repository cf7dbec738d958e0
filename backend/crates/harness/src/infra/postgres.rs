//! PostgreSQL Job Store
//!
//! Claims use `FOR UPDATE SKIP LOCKED`. The instance-cap check and port
//! candidates are serialised with transaction-scoped advisory locks, so
//! nothing is released until the owning transaction ends.

use crate::domain::entities::{Challenge, Job, JobRequest};
use crate::domain::repository::{JobStore, JobTransaction};
use crate::domain::value_objects::{Difficulty, Port};
use crate::error::{HarnessError, HarnessResult};
use chrono::{DateTime, Utc};
use kernel::id::{ChallengeId, JobId};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

/// Advisory lock key guarding the running-instance count
const ADMISSION_LOCK_KEY: i64 = 0x4841_524E_4553_5301;

/// Advisory lock namespace for port candidates (`pg_try_advisory_xact_lock(ns, port)`)
const PORT_LOCK_NAMESPACE: i32 = 0x4852_5450;

const JOB_COLUMNS: &str =
    "uid, payload, connection_id, created_at, leased_at, expires_at, completed_at";

/// PostgreSQL-backed job store
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Delete challenges past their deadline
    pub async fn cleanup_expired(&self) -> HarnessResult<u64> {
        let challenges_deleted = sqlx::query("DELETE FROM challenge WHERE deadline < NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        tracing::info!(
            challenges = challenges_deleted,
            "Cleaned up expired challenges"
        );

        Ok(challenges_deleted)
    }
}

impl JobStore for PgJobStore {
    type Tx = PgJobTx;

    async fn begin(&self) -> HarnessResult<PgJobTx> {
        Ok(PgJobTx {
            tx: self.pool.begin().await?,
        })
    }
}

/// Open PostgreSQL transaction; rolled back on drop unless committed
pub struct PgJobTx {
    tx: Transaction<'static, Postgres>,
}

impl PgJobTx {
    async fn claim(&mut self, condition: &str) -> HarnessResult<Option<Job>> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM job
            WHERE {condition}
            ORDER BY created_at
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(row.map(JobRow::into_job))
    }

    async fn count(&mut self, condition: &str) -> HarnessResult<u64> {
        let sql = format!("SELECT COUNT(*) FROM job WHERE {condition}");
        let count = sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(&mut *self.tx)
            .await?;
        Ok(count.max(0) as u64)
    }
}

impl JobTransaction for PgJobTx {
    async fn lock_admission(&mut self) -> HarnessResult<()> {
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(ADMISSION_LOCK_KEY)
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn count_running(&mut self) -> HarnessResult<u64> {
        self.count("completed_at IS NULL AND expires_at IS NOT NULL")
            .await
    }

    async fn count_queued(&mut self) -> HarnessResult<u64> {
        self.count("completed_at IS NULL AND expires_at IS NULL").await
    }

    async fn count_queued_ahead(&mut self, job_id: JobId) -> HarnessResult<u64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM job
            WHERE completed_at IS NULL
                AND expires_at IS NULL
                AND created_at < (SELECT created_at FROM job WHERE uid = $1)
            "#,
        )
        .bind(Uuid::from(job_id))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(count.max(0) as u64)
    }

    async fn claim_oldest_queued(&mut self) -> HarnessResult<Option<Job>> {
        self.claim("completed_at IS NULL AND expires_at IS NULL")
            .await
    }

    async fn claim_oldest_expired(&mut self) -> HarnessResult<Option<Job>> {
        self.claim("completed_at IS NULL AND expires_at IS NOT NULL AND expires_at <= NOW()")
            .await
    }

    async fn lock_job(&mut self, job_id: JobId) -> HarnessResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM job WHERE uid = $1 FOR UPDATE");
        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(Uuid::from(job_id))
            .fetch_optional(&mut *self.tx)
            .await?;

        Ok(row.map(JobRow::into_job))
    }

    async fn port_for(&mut self, job_id: JobId) -> HarnessResult<Option<Port>> {
        let port = sqlx::query_scalar::<_, i32>("SELECT port FROM port WHERE job_uid = $1")
            .bind(Uuid::from(job_id))
            .fetch_optional(&mut *self.tx)
            .await?;

        port.map(|raw| {
            u16::try_from(raw)
                .ok()
                .and_then(Port::new)
                .ok_or_else(|| HarnessError::Internal(format!("stored port {raw} out of range")))
        })
        .transpose()
    }

    async fn set_lease(&mut self, job_id: JobId, until: DateTime<Utc>) -> HarnessResult<()> {
        sqlx::query(
            r#"
            UPDATE job
            SET expires_at = $2, leased_at = COALESCE(leased_at, NOW())
            WHERE uid = $1 AND completed_at IS NULL
            "#,
        )
        .bind(Uuid::from(job_id))
        .bind(until)
        .execute(&mut *self.tx)
        .await?;

        tracing::debug!(job_id = %job_id, %until, "Lease set");
        Ok(())
    }

    async fn mark_expired_now(&mut self, job_id: JobId) -> HarnessResult<bool> {
        let updated = sqlx::query(
            "UPDATE job SET expires_at = NOW() WHERE uid = $1 AND completed_at IS NULL",
        )
        .bind(Uuid::from(job_id))
        .execute(&mut *self.tx)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn mark_completed(&mut self, job_id: JobId) -> HarnessResult<()> {
        sqlx::query("UPDATE job SET completed_at = NOW() WHERE uid = $1 AND completed_at IS NULL")
            .bind(Uuid::from(job_id))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn insert_challenge(&mut self, challenge: &Challenge) -> HarnessResult<()> {
        sqlx::query(
            r#"
            INSERT INTO challenge (uid, prefix, difficulty, deadline)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::from(challenge.id))
        .bind(&challenge.prefix)
        .bind(i16::from(challenge.difficulty.bits()))
        .bind(challenge.deadline)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn lock_challenge(&mut self, id: ChallengeId) -> HarnessResult<Option<Challenge>> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            r#"
            SELECT uid, prefix, difficulty, deadline
            FROM challenge
            WHERE uid = $1
            FOR UPDATE
            "#,
        )
        .bind(Uuid::from(id))
        .fetch_optional(&mut *self.tx)
        .await?;

        row.map(ChallengeRow::into_challenge).transpose()
    }

    async fn delete_challenge(&mut self, id: ChallengeId) -> HarnessResult<()> {
        sqlx::query("DELETE FROM challenge WHERE uid = $1")
            .bind(Uuid::from(id))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn delete_expired_challenges(&mut self, now: DateTime<Utc>) -> HarnessResult<u64> {
        let deleted = sqlx::query("DELETE FROM challenge WHERE deadline <= $1")
            .bind(now)
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        Ok(deleted)
    }

    async fn try_reserve_port(&mut self, port: Port) -> HarnessResult<bool> {
        let locked = sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_xact_lock($1, $2)")
            .bind(PORT_LOCK_NAMESPACE)
            .bind(i32::from(port.get()))
            .fetch_one(&mut *self.tx)
            .await?;

        if !locked {
            return Ok(false);
        }

        let in_use = sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS(
                SELECT 1
                FROM port
                JOIN job ON job.uid = port.job_uid
                WHERE port.port = $1 AND job.completed_at IS NULL
            )
            "#,
        )
        .bind(i32::from(port.get()))
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(!in_use)
    }

    async fn insert_job(&mut self, job: &Job) -> HarnessResult<()> {
        sqlx::query(
            r#"
            INSERT INTO job (uid, payload, connection_id, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::from(job.id))
        .bind(Json(&job.request))
        .bind(Uuid::from(job.connection_id))
        .bind(job.created_at)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    async fn insert_port(&mut self, job_id: JobId, port: Port) -> HarnessResult<()> {
        sqlx::query("INSERT INTO port (job_uid, port) VALUES ($1, $2)")
            .bind(Uuid::from(job_id))
            .bind(i32::from(port.get()))
            .execute(&mut *self.tx)
            .await?;
        Ok(())
    }

    async fn commit(self) -> HarnessResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self) -> HarnessResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}

// Internal row types for sqlx mapping
#[derive(sqlx::FromRow)]
struct JobRow {
    uid: Uuid,
    payload: Json<serde_json::Value>,
    connection_id: Uuid,
    created_at: DateTime<Utc>,
    leased_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    fn into_job(self) -> Job {
        Job {
            id: self.uid.into(),
            request: JobRequest(self.payload.0),
            connection_id: self.connection_id.into(),
            created_at: self.created_at,
            leased_at: self.leased_at,
            expires_at: self.expires_at,
            completed_at: self.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ChallengeRow {
    uid: Uuid,
    prefix: String,
    difficulty: i16,
    deadline: DateTime<Utc>,
}

impl ChallengeRow {
    fn into_challenge(self) -> HarnessResult<Challenge> {
        let difficulty = u8::try_from(self.difficulty)
            .ok()
            .and_then(Difficulty::new)
            .ok_or_else(|| {
                HarnessError::Internal(format!("stored difficulty {} out of range", self.difficulty))
            })?;

        Ok(Challenge {
            id: self.uid.into(),
            prefix: self.prefix,
            difficulty,
            deadline: self.deadline,
        })
    }
}
