//! Domain Entities

use crate::domain::value_objects::{Difficulty, Port};
use chrono::{DateTime, TimeDelta, Utc};
use kernel::id::{ChallengeId, ConnectionId, JobId};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// `now + duration`, saturating at the far end of the calendar
pub fn deadline_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Opaque client request payload; stored and echoed, never interpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobRequest(pub serde_json::Value);

/// Where the client reaches its instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobResponse {
    pub url: String,
}

impl JobResponse {
    pub fn for_port(target_host: &str, port: Port) -> Self {
        Self {
            url: format!("{}:{}/", target_host.trim_end_matches('/'), port),
        }
    }
}

/// Lifecycle position of a job, derived from its timestamps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// No lease yet
    Queued,
    /// Lease granted and still in the future
    Leased,
    /// Lease in the past, not yet completed
    ReapEligible,
    /// Terminal
    Completed,
}

/// Job row. Never deleted; `completed_at` closes it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub request: JobRequest,
    /// Weak back-reference; the connection may be long gone
    pub connection_id: ConnectionId,
    pub created_at: DateTime<Utc>,
    /// First time a worker granted a lease (container launch was attempted)
    pub leased_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(request: JobRequest, connection_id: ConnectionId) -> Self {
        Self {
            id: JobId::new(),
            request,
            connection_id,
            created_at: Utc::now(),
            leased_at: None,
            expires_at: None,
            completed_at: None,
        }
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> JobStatus {
        match (self.completed_at, self.expires_at) {
            (Some(_), _) => JobStatus::Completed,
            (None, None) => JobStatus::Queued,
            (None, Some(expires_at)) if expires_at > now => JobStatus::Leased,
            (None, Some(_)) => JobStatus::ReapEligible,
        }
    }

    /// Holds a slot against the instance cap
    pub fn is_running(&self) -> bool {
        self.completed_at.is_none() && self.expires_at.is_some()
    }

    pub fn is_queued(&self) -> bool {
        self.completed_at.is_none() && self.expires_at.is_none()
    }

    /// A container may exist for this job
    pub fn was_leased(&self) -> bool {
        self.leased_at.is_some()
    }
}

/// Single-use proof-of-work puzzle
#[derive(Debug, Clone)]
pub struct Challenge {
    pub id: ChallengeId,
    pub prefix: String,
    pub difficulty: Difficulty,
    pub deadline: DateTime<Utc>,
}

impl Challenge {
    pub fn new(prefix: String, difficulty: Difficulty, ttl: Duration) -> Self {
        Self {
            id: ChallengeId::new(),
            prefix,
            difficulty,
            deadline: deadline_after(Utc::now(), ttl),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.deadline
    }
}
