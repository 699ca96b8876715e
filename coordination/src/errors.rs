//! Orchestrator error taxonomy with retry classification.
//!
//! | Category        | Retriable | Handling                                    |
//! |-----------------|-----------|---------------------------------------------|
//! | Transient       | yes       | backend unreachable or timed out            |
//! | BackendFault    | yes       | malformed reply or error marker             |
//! | Admission       | no        | gate closed or queue wait exceeded          |
//! | Compression     | no        | counted, answered with extractive summary   |
//! | VoteParse       | no        | vote discarded, voting continues            |
//! | Exhausted       | no        | task ends FAILED with best partial output   |
//! | Persistence     | no        | engine continues in degraded in-memory mode |
//! | Caller          | no        | bad task id, busy task, bad config          |
//! | Cancelled       | no        | stage loop stops, persisted state kept      |

use std::fmt;

use thiserror::Error;

use crate::backend::{BackendError, BackendRole};
use crate::config::ConfigError;
use crate::context::SummarizationError;
use crate::state::{Stage, StoreError};

/// Classification used to decide whether a failed step may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryCategory {
    Transient,
    BackendFault,
    Admission,
    Compression,
    VoteParse,
    Exhausted,
    Persistence,
    Caller,
    Cancelled,
}

impl RetryCategory {
    pub fn is_retriable(self) -> bool {
        matches!(self, Self::Transient | Self::BackendFault)
    }
}

impl fmt::Display for RetryCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::BackendFault => write!(f, "backend_fault"),
            Self::Admission => write!(f, "admission"),
            Self::Compression => write!(f, "compression"),
            Self::VoteParse => write!(f, "vote_parse"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Persistence => write!(f, "persistence"),
            Self::Caller => write!(f, "caller"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Unified error type for the workflow surface.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Connect failure or timeout talking to a backend role.
    #[error("Backend unavailable [{role}]: {detail}")]
    BackendUnavailable { role: BackendRole, detail: String },

    /// Malformed or error-marker response.
    #[error("Backend error [{role}]: {detail}")]
    Backend { role: BackendRole, detail: String },

    /// The role's admission gate refused the call.
    #[error("Admission refused [{role}]: {detail}")]
    AdmissionRefused { role: BackendRole, detail: String },

    /// Summarization failed. Never escapes the compressor; kept for callers
    /// that drive a summarizer directly.
    #[error("Compression failure: {0}")]
    CompressionFailure(#[from] SummarizationError),

    #[error("Unparsable vote: {0}")]
    VoteParseFailure(String),

    #[error("Iteration budget ({0}) exhausted")]
    IterationExhausted(u32),

    #[error("Persistence unavailable: {0}")]
    PersistenceUnavailable(#[from] StoreError),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// Another execution currently holds the task.
    #[error("Task busy: {0}")]
    TaskBusy(String),

    #[error("Task cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Illegal stage transition: {from} -> {to}")]
    IllegalTransition { from: Stage, to: Stage },
}

impl From<BackendError> for OrchestratorError {
    fn from(err: BackendError) -> Self {
        let role = err.role();
        let detail = err.to_string();
        match err {
            _ if err.is_unavailable() => Self::BackendUnavailable { role, detail },
            BackendError::Admission { .. } => Self::AdmissionRefused { role, detail },
            _ => Self::Backend { role, detail },
        }
    }
}

impl OrchestratorError {
    pub fn retry_category(&self) -> RetryCategory {
        match self {
            Self::BackendUnavailable { .. } => RetryCategory::Transient,
            Self::Backend { .. } => RetryCategory::BackendFault,
            Self::AdmissionRefused { .. } => RetryCategory::Admission,
            Self::CompressionFailure(_) => RetryCategory::Compression,
            Self::VoteParseFailure(_) => RetryCategory::VoteParse,
            Self::IterationExhausted(_) | Self::IllegalTransition { .. } => RetryCategory::Exhausted,
            Self::PersistenceUnavailable(_) => RetryCategory::Persistence,
            Self::TaskNotFound(_) | Self::TaskBusy(_) | Self::Configuration(_) => RetryCategory::Caller,
            Self::Cancelled(_) => RetryCategory::Cancelled,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.retry_category().is_retriable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_timeout_maps_to_unavailable() {
        let err: OrchestratorError = BackendError::Timeout {
            role: BackendRole::Coder,
            secs: 30,
        }
        .into();
        assert!(matches!(err, OrchestratorError::BackendUnavailable { .. }));
        assert!(err.is_retriable());
        assert_eq!(err.retry_category(), RetryCategory::Transient);
    }

    #[test]
    fn malformed_reply_is_retriable_backend_error() {
        let err: OrchestratorError = BackendError::Malformed {
            role: BackendRole::Reviewer,
            detail: "HTTP 500".into(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::Backend { .. }));
        assert!(err.is_retriable());
    }

    #[test]
    fn admission_refusal_is_not_retriable() {
        let err: OrchestratorError = BackendError::Admission {
            role: BackendRole::Voter,
            detail: "admission gate for voter is closed".into(),
        }
        .into();
        assert!(matches!(err, OrchestratorError::AdmissionRefused { .. }));
        assert_eq!(err.retry_category(), RetryCategory::Admission);
        assert!(!err.is_retriable());
    }

    #[test]
    fn iteration_exhausted_is_terminal() {
        let err = OrchestratorError::IterationExhausted(3);
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("(3)"));
    }

    #[test]
    fn persistence_is_not_retriable() {
        let err = OrchestratorError::from(StoreError::Unavailable("disk full".into()));
        assert_eq!(err.retry_category(), RetryCategory::Persistence);
        assert!(!err.is_retriable());
    }

    #[test]
    fn illegal_transition_display() {
        let err = OrchestratorError::IllegalTransition {
            from: Stage::Created,
            to: Stage::Review,
        };
        assert_eq!(err.to_string(), "Illegal stage transition: created -> review");
    }
}
