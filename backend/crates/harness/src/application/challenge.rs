//! Challenge Service
//!
//! Issues single-use proof-of-work challenges whose difficulty tracks the
//! queue depth, and turns a valid response into a queued job with a
//! reserved port.

use crate::application::config::HarnessConfig;
use crate::application::ports::PortAllocator;
use crate::domain::entities::{Challenge, Job, JobRequest};
use crate::domain::repository::{JobStore, JobTransaction};
use crate::domain::services::verify_response;
use crate::domain::value_objects::{Difficulty, Port};
use crate::error::{HarnessError, HarnessResult};
use chrono::Utc;
use kernel::id::{ChallengeId, ConnectionId, JobId};
use platform::crypto::random_hex;
use std::sync::Arc;

const PREFIX_BYTES: usize = 12;

/// Result of checking a response against a live challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Job and port allocation were committed together
    Accepted { job_id: JobId, port: Port },
    /// Hash did not meet the difficulty; the challenge is gone regardless
    Mismatch,
}

pub struct ChallengeService<S>
where
    S: JobStore,
{
    store: Arc<S>,
    ports: PortAllocator,
    config: Arc<HarnessConfig>,
}

impl<S> ChallengeService<S>
where
    S: JobStore,
{
    pub fn new(store: Arc<S>, config: Arc<HarnessConfig>) -> Self {
        Self {
            store,
            ports: PortAllocator::new(config.max_port_attempts),
            config,
        }
    }

    pub async fn current_difficulty(&self) -> HarnessResult<Difficulty> {
        let mut tx = self.store.begin().await?;
        let queued = tx.count_queued().await?;
        tx.rollback().await?;
        Ok(Difficulty::for_queue_depth(queued))
    }

    pub async fn generate_challenge(&self) -> HarnessResult<Challenge> {
        let difficulty = self.current_difficulty().await?;
        let challenge = Challenge::new(
            random_hex(PREFIX_BYTES),
            difficulty,
            self.config.challenge_ttl,
        );

        let mut tx = self.store.begin().await?;
        tx.insert_challenge(&challenge).await?;
        tx.commit().await?;

        tracing::info!(
            challenge_id = %challenge.id,
            difficulty = difficulty.bits(),
            "Issued challenge"
        );

        Ok(challenge)
    }

    /// Drop an unanswered challenge; unknown ids are ignored
    pub async fn discard_challenge(&self, id: ChallengeId) -> HarnessResult<()> {
        let mut tx = self.store.begin().await?;
        tx.delete_challenge(id).await?;
        tx.commit().await?;
        tracing::debug!(challenge_id = %id, "Discarded unanswered challenge");
        Ok(())
    }

    /// Consume challenge `id` and, if `response` solves it, enqueue `request`
    ///
    /// The challenge row is deleted whatever the outcome. An unknown or
    /// expired id is `InvalidChallenge`.
    pub async fn validate_challenge(
        &self,
        id: ChallengeId,
        response: &str,
        request: JobRequest,
        connection_id: ConnectionId,
    ) -> HarnessResult<ValidationOutcome> {
        let mut tx = self.store.begin().await?;

        let Some(challenge) = tx.lock_challenge(id).await? else {
            tracing::warn!(challenge_id = %id, "Challenge not found");
            return Err(HarnessError::InvalidChallenge);
        };
        tx.delete_challenge(id).await?;

        if challenge.is_expired_at(Utc::now()) {
            tx.commit().await?;
            tracing::warn!(challenge_id = %id, "Challenge expired");
            return Err(HarnessError::InvalidChallenge);
        }

        if !verify_response(&challenge.prefix, response, challenge.difficulty) {
            tx.commit().await?;
            tracing::debug!(challenge_id = %id, "Challenge response mismatch");
            return Ok(ValidationOutcome::Mismatch);
        }

        let port = match self.ports.allocate(&mut tx).await {
            Ok(port) => port,
            Err(err @ HarnessError::PortExhaustion { .. }) => {
                tx.commit().await?;
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let job = Job::new(request, connection_id);
        tx.insert_job(&job).await?;
        tx.insert_port(job.id, port).await?;
        tx.commit().await?;

        tracing::info!(
            job_id = %job.id,
            port = port.get(),
            difficulty = challenge.difficulty.bits(),
            "Job queued"
        );

        Ok(ValidationOutcome::Accepted {
            job_id: job.id,
            port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::services::solve;
    use crate::infra::memory::MemoryJobStore;
    use serde_json::json;
    use std::time::Duration;

    fn service(config: HarnessConfig) -> (Arc<MemoryJobStore>, ChallengeService<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        (store.clone(), ChallengeService::new(store, Arc::new(config)))
    }

    fn request() -> JobRequest {
        JobRequest(json!({ "program": "2 * 21" }))
    }

    /// First decimal candidate that fails the check
    fn wrong_response(challenge: &Challenge) -> String {
        (0u64..)
            .map(|n| n.to_string())
            .find(|r| !verify_response(&challenge.prefix, r, challenge.difficulty))
            .unwrap()
    }

    #[tokio::test]
    async fn test_generate_challenge_on_idle_queue() {
        let (store, service) = service(HarnessConfig::default());
        let challenge = service.generate_challenge().await.unwrap();

        assert_eq!(challenge.difficulty.bits(), 16);
        assert_eq!(challenge.prefix.len(), PREFIX_BYTES * 2);
        assert!(challenge.prefix.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(store.challenge_count(), 1);
    }

    #[tokio::test]
    async fn test_valid_response_queues_job_with_port() {
        let (store, service) = service(HarnessConfig::default());
        let challenge = service.generate_challenge().await.unwrap();
        let response = solve(&challenge.prefix, challenge.difficulty, 50_000_000).unwrap();
        let connection_id = ConnectionId::new();

        let outcome = service
            .validate_challenge(challenge.id, &response, request(), connection_id)
            .await
            .unwrap();

        let ValidationOutcome::Accepted { job_id, port } = outcome else {
            panic!("expected acceptance, got {outcome:?}");
        };
        let job = store.job(job_id).unwrap();
        assert!(job.is_queued());
        assert_eq!(job.connection_id, connection_id);
        assert_eq!(job.request, request());
        assert_eq!(store.port_of(job_id), Some(port));
        assert_eq!(store.challenge_count(), 0);
    }

    #[tokio::test]
    async fn test_mismatch_consumes_challenge() {
        let (store, service) = service(HarnessConfig::default());
        let challenge = service.generate_challenge().await.unwrap();

        let outcome = service
            .validate_challenge(
                challenge.id,
                &wrong_response(&challenge),
                request(),
                ConnectionId::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome, ValidationOutcome::Mismatch);
        assert_eq!(store.challenge_count(), 0);
        assert!(store.jobs().is_empty());

        let replay = service
            .validate_challenge(challenge.id, "0", request(), ConnectionId::new())
            .await;
        assert!(matches!(replay, Err(HarnessError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_expired_challenge_is_invalid() {
        let (store, service) = service(HarnessConfig {
            challenge_ttl: Duration::ZERO,
            ..HarnessConfig::default()
        });
        let challenge = service.generate_challenge().await.unwrap();
        let response = solve(&challenge.prefix, challenge.difficulty, 50_000_000).unwrap();

        let result = service
            .validate_challenge(challenge.id, &response, request(), ConnectionId::new())
            .await;
        assert!(matches!(result, Err(HarnessError::InvalidChallenge)));
        assert_eq!(store.challenge_count(), 0);
    }

    #[tokio::test]
    async fn test_discarded_challenge_cannot_be_answered() {
        let (store, service) = service(HarnessConfig::default());
        let challenge = service.generate_challenge().await.unwrap();
        let response = solve(&challenge.prefix, challenge.difficulty, 50_000_000).unwrap();

        service.discard_challenge(challenge.id).await.unwrap();
        assert_eq!(store.challenge_count(), 0);
        service.discard_challenge(challenge.id).await.unwrap();

        let result = service
            .validate_challenge(challenge.id, &response, request(), ConnectionId::new())
            .await;
        assert!(matches!(result, Err(HarnessError::InvalidChallenge)));
    }

    #[tokio::test]
    async fn test_difficulty_grows_with_queue() {
        let (store, service) = service(HarnessConfig::default());
        for _ in 0..20 {
            store.seed_queued_job(JobRequest(json!(null)));
        }
        assert_eq!(service.current_difficulty().await.unwrap().bits(), 19);
    }
}
