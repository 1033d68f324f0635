//! # Error Taxonomy
//!
//! Typed failures for each layer of the orchestrator. Stage-level errors are
//! absorbed or escalated by the pipeline; only [`JobFailure`] ever reaches a
//! client, and only as a short message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stages::StageName;

/// Failure reported by an inference backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider rate limited the request")]
    RateLimited,
    #[error("provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unexpected provider response: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Whether another attempt could plausibly succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::RateLimited | ProviderError::Transport(_) => true,
            ProviderError::Http { status, .. } => *status == 408 || *status >= 500,
            ProviderError::InvalidResponse(_) => true,
            ProviderError::Auth(_) => false,
        }
    }
}

/// Typed failure returned by a stage task
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("provider error after {attempts} attempt(s): {source}")]
    Provider {
        attempts: u32,
        #[source]
        source: ProviderError,
    },
    #[error("response did not match the {schema} schema: {message}")]
    SchemaValidation { schema: String, message: String },
    #[error("timed out after {attempts} attempt(s)")]
    Timeout { attempts: u32 },
}

/// Why a job ended in `Failed`
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobFailure {
    #[error("{stage} could not be completed: {message}")]
    CriticalStageFailure { stage: StageName, message: String },
    #[error("job exceeded its time budget of {after_secs}s")]
    JobTimeout { after_secs: u64 },
    #[error("job was interrupted by a restart")]
    Interrupted,
    #[error("job stopped on an internal error: {message}")]
    Internal { message: String },
}

/// Errors from the durable job store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    Duplicate(String),
    #[error("job {0} is not in the store")]
    Missing(String),
    #[error("revision conflict on job {job_id}: expected {expected}, found {found}")]
    Conflict {
        job_id: String,
        expected: u64,
        found: u64,
    },
    #[error("store lock poisoned")]
    Poisoned,
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Errors from the job registry
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error("job {0} already exists")]
    AlreadyExists(String),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: String,
        from: String,
        to: String,
    },
    #[error("job {0} already emitted its terminal event")]
    DuplicateTerminal(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Invalid stage catalog
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("stage {stage} depends on {dependency}, which does not run before it")]
    ForwardDependency {
        stage: StageName,
        dependency: StageName,
    },
    #[error("stage {0} appears more than once")]
    DuplicateStage(StageName),
    #[error("the stage catalog is empty")]
    Empty,
}

/// Rejected submissions
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("idea text must not be empty")]
    EmptyIdea,
    #[error("idea text exceeds {max} characters")]
    TooLong { max: usize },
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::RateLimited.is_retryable());
        assert!(ProviderError::Transport("reset".into()).is_retryable());
        assert!(ProviderError::Http { status: 503, body: String::new() }.is_retryable());
        assert!(ProviderError::Http { status: 408, body: String::new() }.is_retryable());
        assert!(!ProviderError::Http { status: 400, body: String::new() }.is_retryable());
        assert!(!ProviderError::Auth("missing key".into()).is_retryable());
    }

    #[test]
    fn test_job_failure_wire_shape() {
        let failure = JobFailure::CriticalStageFailure {
            stage: StageName::NormalizeIdea,
            message: "bad shape".into(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["kind"], "critical_stage_failure");
        assert_eq!(json["stage"], "normalize_idea");
        assert_eq!(failure.to_string(), "normalize_idea could not be completed: bad shape");
    }
}
