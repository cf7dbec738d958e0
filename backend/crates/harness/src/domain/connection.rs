//! Connection Protocol State Machine
//!
//! | Trigger                   | From                         | To         |
//! |---------------------------|------------------------------|------------|
//! | submit request            | Waiting                      | Challenge  |
//! | valid proof-of-work       | Challenge                    | Queued     |
//! | worker claims job         | Queued                       | Accepted   |
//! | launch delay elapses      | Accepted                     | Processing |
//! | reap / kill               | Queued, Accepted, Processing | Waiting    |
//!
//! Anything else is a protocol violation. Worker and reaper triggers carry
//! the job id and must match the job the connection is tracking.

use crate::domain::entities::{Challenge, JobRequest, JobResponse};
use crate::error::{HarnessError, HarnessResult};
use chrono::{DateTime, Utc};
use kernel::id::JobId;
use std::fmt;

#[derive(Debug, Clone, Default)]
pub enum ConnectionState {
    #[default]
    Waiting,
    Challenge {
        request: JobRequest,
        challenge: Challenge,
    },
    Queued {
        request: JobRequest,
        job_id: JobId,
    },
    Accepted {
        request: JobRequest,
        job_id: JobId,
        response: JobResponse,
        launch_at: DateTime<Utc>,
    },
    Processing {
        request: JobRequest,
        job_id: JobId,
        response: JobResponse,
        lease_until: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Waiting,
    Challenge,
    Queued,
    Accepted,
    Processing,
}

impl fmt::Display for StateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StateKind::Waiting => "waiting",
            StateKind::Challenge => "challenge",
            StateKind::Queued => "queued",
            StateKind::Accepted => "accepted",
            StateKind::Processing => "processing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub enum Trigger {
    SubmitRequest {
        request: JobRequest,
        challenge: Challenge,
    },
    ProofAccepted {
        job_id: JobId,
    },
    WorkerClaimed {
        job_id: JobId,
        response: JobResponse,
        launch_at: DateTime<Utc>,
    },
    LaunchElapsed {
        job_id: JobId,
        lease_until: DateTime<Utc>,
    },
    Reaped {
        job_id: JobId,
    },
}

impl Trigger {
    pub fn name(&self) -> &'static str {
        match self {
            Trigger::SubmitRequest { .. } => "submitJob",
            Trigger::ProofAccepted { .. } => "submitChallenge",
            Trigger::WorkerClaimed { .. } => "accepted",
            Trigger::LaunchElapsed { .. } => "processing",
            Trigger::Reaped { .. } => "done",
        }
    }
}

impl ConnectionState {
    pub fn kind(&self) -> StateKind {
        match self {
            ConnectionState::Waiting => StateKind::Waiting,
            ConnectionState::Challenge { .. } => StateKind::Challenge,
            ConnectionState::Queued { .. } => StateKind::Queued,
            ConnectionState::Accepted { .. } => StateKind::Accepted,
            ConnectionState::Processing { .. } => StateKind::Processing,
        }
    }

    /// Job this connection is tracking, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            ConnectionState::Queued { job_id, .. }
            | ConnectionState::Accepted { job_id, .. }
            | ConnectionState::Processing { job_id, .. } => Some(*job_id),
            ConnectionState::Waiting | ConnectionState::Challenge { .. } => None,
        }
    }

    /// Reject `event` unless the connection is in `required`
    ///
    /// Lets callers bail out before doing work a transition would need.
    pub fn expect(&self, event: &str, required: StateKind) -> HarnessResult<()> {
        if self.kind() == required {
            Ok(())
        } else {
            Err(violation(event, self.kind()))
        }
    }

    pub fn apply(self, trigger: Trigger) -> HarnessResult<ConnectionState> {
        use ConnectionState as S;

        match (self, trigger) {
            (S::Waiting, Trigger::SubmitRequest { request, challenge }) => {
                Ok(S::Challenge { request, challenge })
            }
            (S::Challenge { request, .. }, Trigger::ProofAccepted { job_id }) => {
                Ok(S::Queued { request, job_id })
            }
            (
                S::Queued { request, job_id },
                Trigger::WorkerClaimed {
                    job_id: claimed,
                    response,
                    launch_at,
                },
            ) if claimed == job_id => Ok(S::Accepted {
                request,
                job_id,
                response,
                launch_at,
            }),
            (
                S::Accepted {
                    request,
                    job_id,
                    response,
                    ..
                },
                Trigger::LaunchElapsed {
                    job_id: launched,
                    lease_until,
                },
            ) if launched == job_id => Ok(S::Processing {
                request,
                job_id,
                response,
                lease_until,
            }),
            (
                S::Queued { job_id, .. } | S::Accepted { job_id, .. } | S::Processing { job_id, .. },
                Trigger::Reaped { job_id: reaped },
            ) if reaped == job_id => Ok(S::Waiting),
            (state, trigger) => {
                if let (Some(tracked), Some(other)) = (state.job_id(), trigger_job(&trigger)) {
                    if tracked != other {
                        return Err(HarnessError::ProtocolViolation(format!(
                            "{} for job {} while tracking job {}",
                            trigger.name(),
                            other,
                            tracked
                        )));
                    }
                }
                Err(violation(trigger.name(), state.kind()))
            }
        }
    }
}

fn trigger_job(trigger: &Trigger) -> Option<JobId> {
    match trigger {
        Trigger::ProofAccepted { job_id }
        | Trigger::WorkerClaimed { job_id, .. }
        | Trigger::LaunchElapsed { job_id, .. }
        | Trigger::Reaped { job_id } => Some(*job_id),
        Trigger::SubmitRequest { .. } => None,
    }
}

fn violation(event: &str, state: StateKind) -> HarnessError {
    HarnessError::ProtocolViolation(format!("{} not allowed in {} state", event, state))
}
