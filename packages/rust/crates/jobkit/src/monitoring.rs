//! Read-only, backend-wide monitoring session.

use std::fmt;
use std::sync::Arc;

use jobkit_core::{JobError, JobInfo, JobTemplate, JobTracker, Machine, Monitorer, Queue, Result};
use tracing::info;

use crate::job::{Job, matches_filter};

/// Observes everything a backend runs, independent of any job session.
pub struct MonitoringSession {
    name: String,
    tracker: Arc<dyn JobTracker>,
}

impl MonitoringSession {
    /// Monitoring session over `tracker`.
    ///
    /// # Errors
    ///
    /// [`JobError::UnsupportedOperation`] when the backend cannot monitor.
    pub fn new(name: impl Into<String>, tracker: Arc<dyn JobTracker>) -> Result<Self> {
        let name = name.into();
        if tracker.as_monitorer().is_none() {
            return Err(JobError::UnsupportedOperation(format!(
                "backend of monitoring session '{name}' does not support monitoring"
            )));
        }
        Ok(Self { name, tracker })
    }

    /// Session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn monitor(&self) -> Result<&dyn Monitorer> {
        self.tracker.as_monitorer().ok_or_else(|| {
            JobError::UnsupportedOperation("backend does not support monitoring".to_string())
        })
    }

    /// Every job the backend knows, as read-only handles.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn all_jobs(&self, filter: Option<&JobInfo>) -> Result<Vec<Job<'_>>> {
        let infos = self.monitor()?.all_jobs().await?;
        let mut jobs = Vec::with_capacity(infos.len());
        for info in infos {
            if filter.is_some_and(|filter| !matches_filter(&info, filter)) {
                continue;
            }
            let template = match self.tracker.as_job_templater() {
                Some(templater) => templater.job_template(&info.id).await.unwrap_or_default(),
                None => JobTemplate::default(),
            };
            jobs.push(Job::new(
                info.id,
                &self.name,
                template,
                self.tracker.as_ref(),
                true,
            ));
        }
        Ok(jobs)
    }

    /// Queues, optionally restricted to `names`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn all_queues(&self, names: &[String]) -> Result<Vec<Queue>> {
        self.monitor()?.all_queues(names).await
    }

    /// Machines, optionally restricted to `names`.
    ///
    /// # Errors
    ///
    /// Propagates backend errors.
    pub async fn all_machines(&self, names: &[String]) -> Result<Vec<Machine>> {
        self.monitor()?.all_machines(names).await
    }

    /// Information about any job.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for unknown ids.
    pub async fn job_info(&self, job_id: &str) -> Result<JobInfo> {
        self.monitor()?.job_info_by_id(job_id).await
    }

    /// Release backend resources.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error.
    pub async fn close(&self) -> Result<()> {
        if let Some(closer) = self.tracker.as_session_closer() {
            closer.close().await?;
        }
        info!(session = %self.name, "Monitoring session closed");
        Ok(())
    }
}

impl fmt::Debug for MonitoringSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitoringSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
