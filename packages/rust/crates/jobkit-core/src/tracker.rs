//! The contract every backend implements, plus optional capabilities.
//!
//! Capabilities are discovered at runtime: a tracker overrides the matching
//! `as_*` query to hand out a view of itself. Callers never downcast.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::info::{JobInfo, Machine, Queue};
use crate::state::{JobAction, JobState};
use crate::template::JobTemplate;

/// Turns job templates into units of work and reports their state.
#[async_trait]
pub trait JobTracker: Send + Sync {
    /// Ids of all jobs known to this tracker; array jobs contribute their tasks.
    async fn list_jobs(&self) -> Result<Vec<String>>;

    /// Task ids (`<arrayid>.<index>`) of one array job.
    async fn list_array_jobs(&self, array_id: &str) -> Result<Vec<String>>;

    /// Submit a single job and return its id.
    async fn add_job(&self, template: JobTemplate) -> Result<String>;

    /// Submit an array job over `begin..=end` by `step`, running at most
    /// `max_parallel` tasks at a time (0 means unbounded).
    async fn add_array_job(
        &self,
        template: JobTemplate,
        begin: u64,
        end: u64,
        step: u64,
        max_parallel: u64,
    ) -> Result<String>;

    /// Current state and backend sub state.
    async fn job_state(&self, job_id: &str) -> Result<(JobState, String)>;

    /// Detailed information about a job.
    async fn job_info(&self, job_id: &str) -> Result<JobInfo>;

    /// Apply a control action.
    async fn job_control(&self, job_id: &str, action: JobAction) -> Result<()>;

    /// Block until the job is in one of `states`; a zero timeout waits forever.
    async fn wait(&self, job_id: &str, timeout: Duration, states: &[JobState]) -> Result<()>;

    /// Forget a terminal job.
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    /// Categories the backend understands.
    async fn list_job_categories(&self) -> Result<Vec<String>>;

    /// Contact string capability.
    fn as_contact_stringer(&self) -> Option<&dyn ContactStringer> {
        None
    }

    /// Template retrieval capability.
    fn as_job_templater(&self) -> Option<&dyn JobTemplater> {
        None
    }

    /// Session close capability.
    fn as_session_closer(&self) -> Option<&dyn SessionCloser> {
        None
    }

    /// Cluster-wide monitoring capability.
    fn as_monitorer(&self) -> Option<&dyn Monitorer> {
        None
    }
}

/// Exposes an opaque token that lets a session reattach after a restart.
pub trait ContactStringer: Send + Sync {
    /// The current contact string.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend connection has no contact yet.
    fn contact_string(&self) -> Result<String>;
}

/// Returns the template a job was submitted with.
#[async_trait]
pub trait JobTemplater: Send + Sync {
    /// Template of `job_id` (array task ids resolve to the array's template).
    async fn job_template(&self, job_id: &str) -> Result<JobTemplate>;
}

/// Releases backend resources held by a session.
#[async_trait]
pub trait SessionCloser: Send + Sync {
    /// Close the session; later calls may fail.
    async fn close(&self) -> Result<()>;
}

/// Read-only view over everything the backend runs, independent of a session.
#[async_trait]
pub trait Monitorer: Send + Sync {
    /// Information about every job the backend knows.
    async fn all_jobs(&self) -> Result<Vec<JobInfo>>;

    /// Queues, optionally restricted to `names`.
    async fn all_queues(&self, names: &[String]) -> Result<Vec<Queue>>;

    /// Machines, optionally restricted to `names`.
    async fn all_machines(&self, names: &[String]) -> Result<Vec<Machine>>;

    /// Information about any job by id.
    async fn job_info_by_id(&self, job_id: &str) -> Result<JobInfo>;
}
