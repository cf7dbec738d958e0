//! Harness Error Types
//!
//! Harness-specific failures. Per-job failures are caught by the loop that
//! owns the job and turned into job state transitions; connection-level
//! failures end with an `error` message and a forced disconnect.

use kernel::error::{app_error::AppError, kind::ErrorKind};
use thiserror::Error;

pub type HarnessResult<T> = Result<T, HarnessError>;

#[derive(Debug, Error)]
pub enum HarnessError {
    /// Challenge id unknown, already consumed, or past its deadline
    #[error("Invalid challenge")]
    InvalidChallenge,

    /// Proof-of-work response does not satisfy the difficulty
    #[error("Invalid challenge response")]
    ProofOfWorkMismatch,

    /// Event received while the connection is in the wrong state
    #[error("Invalid socket state: {0}")]
    ProtocolViolation(String),

    /// Frame could not be decoded into a protocol message
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Container start failed (subprocess or I/O)
    #[error("Launch failed: {0}")]
    LaunchFailure(String),

    /// Container teardown failed; the container may already be gone
    #[error("Teardown failed: {0}")]
    TeardownFailure(String),

    /// No free port found within the attempt budget
    #[error("No free port after {attempts} attempts")]
    PortExhaustion { attempts: u32 },

    #[error("Invalid configuration value for {key}: {value:?}")]
    InvalidConfig { key: String, value: String },

    /// Duplex channel failed underneath the session
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::InvalidChallenge => ErrorKind::Gone,
            HarnessError::ProofOfWorkMismatch => ErrorKind::Conflict,
            HarnessError::ProtocolViolation(_) | HarnessError::MalformedMessage(_) => {
                ErrorKind::BadRequest
            }
            HarnessError::PortExhaustion { .. } => ErrorKind::ServiceUnavailable,
            HarnessError::LaunchFailure(_)
            | HarnessError::TeardownFailure(_)
            | HarnessError::InvalidConfig { .. }
            | HarnessError::Transport(_)
            | HarnessError::Database(_)
            | HarnessError::Internal(_) => ErrorKind::InternalServerError,
        }
    }

    /// Text sent to the client in the `error` protocol message
    ///
    /// Server-side failures are not described to the client.
    pub fn client_message(&self) -> String {
        if self.kind().is_client_error() {
            self.to_string()
        } else {
            "something went wrong".to_string()
        }
    }

    /// Log the error with appropriate level
    pub fn log(&self) {
        match self {
            HarnessError::Database(e) => {
                tracing::error!(error = %e, "Harness database error");
            }
            HarnessError::Internal(msg) => {
                tracing::error!(message = %msg, "Harness internal error");
            }
            HarnessError::LaunchFailure(msg) => {
                tracing::error!(message = %msg, "Container launch failed");
            }
            HarnessError::PortExhaustion { attempts } => {
                tracing::error!(attempts, "Port allocation exhausted");
            }
            HarnessError::ProofOfWorkMismatch | HarnessError::ProtocolViolation(_) => {
                tracing::warn!(error = %self, "Client protocol fault");
            }
            _ => {
                tracing::debug!(error = %self, "Harness error");
            }
        }
    }
}

impl From<HarnessError> for AppError {
    fn from(err: HarnessError) -> Self {
        let kind = err.kind();
        let message = if kind.is_server_error() {
            kind.as_str().to_string()
        } else {
            err.to_string()
        };
        AppError::new(kind, message).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let cases: Vec<(HarnessError, ErrorKind)> = vec![
            (HarnessError::InvalidChallenge, ErrorKind::Gone),
            (HarnessError::ProofOfWorkMismatch, ErrorKind::Conflict),
            (
                HarnessError::ProtocolViolation("x".into()),
                ErrorKind::BadRequest,
            ),
            (
                HarnessError::PortExhaustion { attempts: 64 },
                ErrorKind::ServiceUnavailable,
            ),
            (
                HarnessError::LaunchFailure("exit 1".into()),
                ErrorKind::InternalServerError,
            ),
            (
                HarnessError::Database(sqlx::Error::PoolTimedOut),
                ErrorKind::InternalServerError,
            ),
        ];

        for (error, expected) in cases {
            assert_eq!(error.kind(), expected, "{}", error);
        }
    }

    #[test]
    fn test_client_message_hides_server_faults() {
        assert_eq!(
            HarnessError::InvalidChallenge.client_message(),
            "Invalid challenge"
        );
        assert_eq!(
            HarnessError::Internal("pool poisoned".into()).client_message(),
            "something went wrong"
        );
        assert!(
            HarnessError::ProtocolViolation("submitJob in queued state".into())
                .client_message()
                .contains("submitJob")
        );
    }

    #[test]
    fn test_into_app_error() {
        let app: AppError = HarnessError::PortExhaustion { attempts: 3 }.into();
        assert_eq!(app.status_code(), 503);
        assert_eq!(app.message(), "Service Unavailable");

        let app: AppError = HarnessError::InvalidChallenge.into();
        assert_eq!(app.status_code(), 410);
        assert_eq!(app.message(), "Invalid challenge");
    }
}
