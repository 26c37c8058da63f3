//! Error taxonomy shared by trackers, stores, and sessions.

use thiserror::Error;

/// Errors surfaced by every jobkit operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JobError {
    /// The request cannot be used as given (e.g. a template without a command).
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not valid in the job's current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Unknown job, session, or task index.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The backend has no such transition or capability.
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A bounded wait elapsed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An OS, storage, or transport level failure.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Several independent operations failed.
    #[error("{} operations failed: [{}]", .0.len(), join_errors(.0))]
    Aggregate(Vec<JobError>),
}

impl JobError {
    /// Wrap an OS or storage error with the job id and the attempted action.
    pub fn internal(job_id: &str, action: &str, err: impl std::fmt::Display) -> Self {
        Self::Internal(format!("{action} job {job_id}: {err}"))
    }

    /// Convenience for unknown job ids.
    pub fn unknown_job(job_id: &str) -> Self {
        Self::NotFound(format!("job {job_id} is unknown"))
    }

    /// Whether this error is (or only contains) timeouts.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout(_) => true,
            Self::Aggregate(errors) => !errors.is_empty() && errors.iter().all(Self::is_timeout),
            _ => false,
        }
    }
}

fn join_errors(errors: &[JobError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result type for jobkit operations.
pub type Result<T> = std::result::Result<T, JobError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_internal_carries_context() {
        let err = JobError::internal("42", "terminate", "no such process");
        assert_eq!(
            err.to_string(),
            "Internal error: terminate job 42: no such process"
        );
    }

    #[test]
    fn test_aggregate_display() {
        let err = JobError::Aggregate(vec![
            JobError::NotFound("a".to_string()),
            JobError::Timeout("b".to_string()),
        ]);
        assert_eq!(
            err.to_string(),
            "2 operations failed: [Not found: a; Timeout: b]"
        );
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_aggregate_of_timeouts_is_timeout() {
        let err = JobError::Aggregate(vec![JobError::Timeout("x".to_string())]);
        assert!(err.is_timeout());
        assert!(!JobError::Aggregate(Vec::new()).is_timeout());
    }
}
