//! Job state machine and control actions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::JobError;

/// Uniform job state reported by every tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum JobState {
    /// The tracker does not know the job (never submitted or already reaped).
    #[default]
    Undetermined,
    /// Accepted, waiting to be dispatched.
    Queued,
    /// Queued and held by the user or the system.
    QueuedHeld,
    /// Re-queued after having been dispatched once.
    Requeued,
    /// Re-queued and held.
    RequeuedHeld,
    /// Executing.
    Running,
    /// Dispatched, currently stopped.
    Suspended,
    /// Finished with exit status zero.
    Done,
    /// Finished with a non-zero status, killed, or never started.
    Failed,
}

impl JobState {
    /// Done and Failed are the only terminal states.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States accepted by a "wait until started" request.
    pub const STARTED: &'static [JobState] = &[
        JobState::Running,
        JobState::Suspended,
        JobState::Done,
        JobState::Failed,
    ];

    /// States accepted by a "wait until terminated" request.
    pub const TERMINATED: &'static [JobState] = &[JobState::Done, JobState::Failed];

    fn as_str(self) -> &'static str {
        match self {
            Self::Undetermined => "undetermined",
            Self::Queued => "queued",
            Self::QueuedHeld => "queued_held",
            Self::Requeued => "requeued",
            Self::RequeuedHeld => "requeued_held",
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Control operation requested on a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobAction {
    /// Stop a running job.
    Suspend,
    /// Continue a suspended job.
    Resume,
    /// Keep a queued job from being dispatched.
    Hold,
    /// Release a held job.
    Release,
    /// Kill the job (or fail it if it never started).
    Terminate,
}

impl JobAction {
    /// Lower-case name used in logs and error messages.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Suspend => "suspend",
            Self::Resume => "resume",
            Self::Hold => "hold",
            Self::Release => "release",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for JobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobAction {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "suspend" => Ok(Self::Suspend),
            "resume" => Ok(Self::Resume),
            "hold" => Ok(Self::Hold),
            "release" => Ok(Self::Release),
            "terminate" => Ok(Self::Terminate),
            other => Err(JobError::InvalidArgument(format!(
                "unknown job action '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_done_and_failed_are_terminal() {
        let terminal: Vec<JobState> = [
            JobState::Undetermined,
            JobState::Queued,
            JobState::QueuedHeld,
            JobState::Requeued,
            JobState::RequeuedHeld,
            JobState::Running,
            JobState::Suspended,
            JobState::Done,
            JobState::Failed,
        ]
        .into_iter()
        .filter(|s| s.is_terminal())
        .collect();
        assert_eq!(terminal, vec![JobState::Done, JobState::Failed]);
    }

    #[test]
    fn test_action_parse() {
        assert_eq!(
            "Terminate".parse::<JobAction>().ok(),
            Some(JobAction::Terminate)
        );
        assert_eq!(" hold ".parse::<JobAction>().ok(), Some(JobAction::Hold));
        assert!(matches!(
            "explode".parse::<JobAction>(),
            Err(JobError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(JobState::QueuedHeld.to_string(), "queued_held");
        assert_eq!(JobState::default(), JobState::Undetermined);
    }
}
