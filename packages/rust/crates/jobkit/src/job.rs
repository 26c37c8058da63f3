//! Job handles.
//!
//! A [`Job`] borrows the tracker that issued it; the session owning the
//! tracker outlives every handle it hands out.

use std::fmt;
use std::time::Duration;

use jobkit_core::{JobAction, JobError, JobInfo, JobState, JobTemplate, JobTracker, Result};

/// Handle to one submitted job (or one array task).
#[derive(Clone)]
pub struct Job<'t> {
    id: String,
    session_name: String,
    template: JobTemplate,
    tracker: &'t dyn JobTracker,
    read_only: bool,
}

impl<'t> Job<'t> {
    pub(crate) fn new(
        id: impl Into<String>,
        session_name: impl Into<String>,
        template: JobTemplate,
        tracker: &'t dyn JobTracker,
        read_only: bool,
    ) -> Self {
        Self {
            id: id.into(),
            session_name: session_name.into(),
            template,
            tracker,
            read_only,
        }
    }

    /// Job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the session the job belongs to.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Template the job was submitted with (default when unknown).
    #[must_use]
    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    /// Whether mutating operations are refused.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub(crate) fn tracker(&self) -> &'t dyn JobTracker {
        self.tracker
    }

    fn check_writable(&self, operation: &str) -> Result<()> {
        if self.read_only {
            return Err(JobError::UnsupportedOperation(format!(
                "{operation} is not allowed on read-only job {}",
                self.id
            )));
        }
        Ok(())
    }

    async fn control(&self, action: JobAction) -> Result<()> {
        self.check_writable(action.as_str())?;
        self.tracker.job_control(&self.id, action).await
    }

    /// Current state and backend sub state.
    ///
    /// # Errors
    ///
    /// Propagates tracker errors.
    pub async fn state(&self) -> Result<(JobState, String)> {
        self.tracker.job_state(&self.id).await
    }

    /// Detailed job information.
    ///
    /// # Errors
    ///
    /// Propagates tracker errors, e.g. [`JobError::NotFound`] after a reap.
    pub async fn info(&self) -> Result<JobInfo> {
        self.tracker.job_info(&self.id).await
    }

    /// Stop the job.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] for read-only jobs, else tracker errors.
    pub async fn suspend(&self) -> Result<()> {
        self.control(JobAction::Suspend).await
    }

    /// Continue a suspended job.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] for read-only jobs, else tracker errors.
    pub async fn resume(&self) -> Result<()> {
        self.control(JobAction::Resume).await
    }

    /// Hold a queued job.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] for read-only jobs, else tracker errors.
    pub async fn hold(&self) -> Result<()> {
        self.control(JobAction::Hold).await
    }

    /// Release a held job.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] for read-only jobs, else tracker errors.
    pub async fn release(&self) -> Result<()> {
        self.control(JobAction::Release).await
    }

    /// Kill the job.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] for read-only jobs, else tracker errors.
    pub async fn terminate(&self) -> Result<()> {
        self.control(JobAction::Terminate).await
    }

    /// Wait until the job runs or already ran; zero waits forever.
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] when the timeout elapses.
    pub async fn wait_started(&self, timeout: Duration) -> Result<()> {
        self.tracker
            .wait(&self.id, timeout, JobState::STARTED)
            .await
    }

    /// Wait until the job is Done or Failed; zero waits forever.
    ///
    /// # Errors
    ///
    /// [`JobError::Timeout`] when the timeout elapses.
    pub async fn wait_terminated(&self, timeout: Duration) -> Result<()> {
        self.tracker
            .wait(&self.id, timeout, JobState::TERMINATED)
            .await
    }

    /// Drop the bookkeeping of a finished job.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidState`] while the job has not terminated.
    pub async fn reap(&self) -> Result<()> {
        self.check_writable("reap")?;
        let (state, _) = self.state().await?;
        if !state.is_terminal() {
            return Err(JobError::InvalidState(format!(
                "job {} is {state}; only finished jobs can be reaped",
                self.id
            )));
        }
        self.tracker.delete_job(&self.id).await
    }
}

impl fmt::Debug for Job<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("session_name", &self.session_name)
            .field("command", &self.template.remote_command)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Handle to an array job and its tasks.
#[derive(Clone, Debug)]
pub struct JobArray<'t> {
    id: String,
    session_name: String,
    template: JobTemplate,
    jobs: Vec<Job<'t>>,
}

impl<'t> JobArray<'t> {
    pub(crate) fn new(
        id: impl Into<String>,
        session_name: impl Into<String>,
        template: JobTemplate,
        jobs: Vec<Job<'t>>,
    ) -> Self {
        Self {
            id: id.into(),
            session_name: session_name.into(),
            template,
            jobs,
        }
    }

    /// Array job id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Name of the session the array belongs to.
    #[must_use]
    pub fn session_name(&self) -> &str {
        &self.session_name
    }

    /// Template shared by every task.
    #[must_use]
    pub fn template(&self) -> &JobTemplate {
        &self.template
    }

    /// Tasks in index order.
    #[must_use]
    pub fn jobs(&self) -> &[Job<'t>] {
        &self.jobs
    }

    /// Applies `action` to every task; all tasks are tried, the first error wins.
    async fn control_all(&self, action: JobAction) -> Result<()> {
        let mut first_error = None;
        for job in &self.jobs {
            if let Err(e) = job.control(action).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Suspend every task.
    ///
    /// # Errors
    ///
    /// The first task error.
    pub async fn suspend(&self) -> Result<()> {
        self.control_all(JobAction::Suspend).await
    }

    /// Resume every task.
    ///
    /// # Errors
    ///
    /// The first task error.
    pub async fn resume(&self) -> Result<()> {
        self.control_all(JobAction::Resume).await
    }

    /// Hold every task.
    ///
    /// # Errors
    ///
    /// The first task error.
    pub async fn hold(&self) -> Result<()> {
        self.control_all(JobAction::Hold).await
    }

    /// Release every task.
    ///
    /// # Errors
    ///
    /// The first task error.
    pub async fn release(&self) -> Result<()> {
        self.control_all(JobAction::Release).await
    }

    /// Terminate every task.
    ///
    /// # Errors
    ///
    /// The first task error.
    pub async fn terminate(&self) -> Result<()> {
        self.control_all(JobAction::Terminate).await
    }
}

/// Whether `info` matches every field set in `filter`.
///
/// Unset fields (empty strings, `Undetermined`, `None`) match anything.
#[must_use]
pub fn matches_filter(info: &JobInfo, filter: &JobInfo) -> bool {
    (filter.id.is_empty() || filter.id == info.id)
        && (filter.state == JobState::Undetermined || filter.state == info.state)
        && (filter.job_owner.is_empty() || filter.job_owner == info.job_owner)
        && (filter.queue_name.is_empty() || filter.queue_name == info.queue_name)
        && (filter.exit_status.is_none() || filter.exit_status == info.exit_status)
        && filter
            .allocated_machines
            .iter()
            .all(|machine| info.allocated_machines.contains(machine))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_filter_matches_everything() {
        let info = JobInfo::new("7", JobState::Running);
        assert!(matches_filter(&info, &JobInfo::default()));
    }

    #[test]
    fn test_filter_on_state_and_owner() {
        let mut info = JobInfo::new("7", JobState::Done);
        info.job_owner = "alice".to_string();

        let mut filter = JobInfo::new("", JobState::Done);
        assert!(matches_filter(&info, &filter));
        filter.job_owner = "bob".to_string();
        assert!(!matches_filter(&info, &filter));
        assert!(!matches_filter(
            &info,
            &JobInfo::new("", JobState::Running)
        ));
    }
}
