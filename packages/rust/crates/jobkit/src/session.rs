//! Job sessions: the caller-facing binding to one tracker.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use jobkit_core::{JobError, JobInfo, JobTemplate, JobTracker, Result};
use tracing::{debug, info};

use crate::job::{Job, JobArray, matches_filter};
use crate::wait_any::wait_any;

/// Normalise a bulk range to ascending `(begin, end, step)` task bounds.
///
/// A descending range visits the same indices as the ascending range that
/// starts at the lowest index it reaches: `9..=1 by -3` is `{9, 6, 3}`,
/// i.e. `3..=9 by 3`.
///
/// # Errors
///
/// [`JobError::InvalidArgument`] when an index is below 1, the step is 0,
/// or the step points away from `end`.
pub fn normalize_bulk_range(begin: i64, end: i64, step: i64) -> Result<(u64, u64, u64)> {
    let invalid = |reason: &str| {
        Err(JobError::InvalidArgument(format!(
            "bulk range {begin}..={end} by {step}: {reason}"
        )))
    };
    if begin < 1 || end < 1 {
        return invalid("indices start at 1");
    }
    if step == 0 {
        return invalid("step must not be 0");
    }
    if begin < end && step < 0 {
        return invalid("ascending range needs a positive step");
    }
    if begin > end && step > 0 {
        return invalid("descending range needs a negative step");
    }

    let stride = step.unsigned_abs();
    let (low, high) = if begin <= end {
        (begin.unsigned_abs(), end.unsigned_abs())
    } else {
        let high = begin.unsigned_abs();
        let span = high - end.unsigned_abs();
        (high - (span / stride) * stride, high)
    };
    Ok((low, high, stride))
}

/// Named binding between a caller and one tracker instance.
pub struct JobSession {
    name: String,
    tracker: Arc<dyn JobTracker>,
}

impl JobSession {
    /// Session `name` driving `tracker`.
    pub fn new(name: impl Into<String>, tracker: Arc<dyn JobTracker>) -> Self {
        Self {
            name: name.into(),
            tracker,
        }
    }

    /// Session name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tracker servicing this session.
    #[must_use]
    pub fn tracker(&self) -> &dyn JobTracker {
        self.tracker.as_ref()
    }

    /// Contact string of the backend, when it exposes one.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error.
    pub fn contact(&self) -> Result<Option<String>> {
        self.tracker
            .as_contact_stringer()
            .map(|stringer| stringer.contact_string())
            .transpose()
    }

    async fn template_of(&self, job_id: &str) -> JobTemplate {
        match self.tracker.as_job_templater() {
            Some(templater) => templater.job_template(job_id).await.unwrap_or_default(),
            None => JobTemplate::default(),
        }
    }

    /// Submit one job.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidArgument`] for an unusable template, else tracker errors.
    pub async fn run_job(&self, template: JobTemplate) -> Result<Job<'_>> {
        let job_id = self.tracker.add_job(template.clone()).await?;
        debug!(session = %self.name, job_id = %job_id, "Job submitted");
        Ok(Job::new(job_id, &self.name, template, self.tracker(), false))
    }

    /// Submit an array job over `begin..=end` by `step`.
    ///
    /// # Errors
    ///
    /// [`JobError::InvalidArgument`] for an invalid range (see
    /// [`normalize_bulk_range`]), else the outcome of the first task.
    pub async fn run_bulk_jobs(
        &self,
        template: JobTemplate,
        begin: i64,
        end: i64,
        step: i64,
        max_parallel: u64,
    ) -> Result<JobArray<'_>> {
        let (low, high, stride) = normalize_bulk_range(begin, end, step)?;
        let array_id = self
            .tracker
            .add_array_job(template.clone(), low, high, stride, max_parallel)
            .await?;
        let task_ids = self.tracker.list_array_jobs(&array_id).await?;
        info!(
            session = %self.name,
            job_id = %array_id,
            tasks = task_ids.len(),
            "Bulk jobs submitted"
        );
        let jobs = task_ids
            .into_iter()
            .map(|id| Job::new(id, &self.name, template.clone(), self.tracker(), false))
            .collect();
        Ok(JobArray::new(array_id, &self.name, template, jobs))
    }

    /// Jobs of this session, optionally restricted to those matching `filter`.
    ///
    /// # Errors
    ///
    /// Propagates tracker errors.
    pub async fn jobs(&self, filter: Option<&JobInfo>) -> Result<Vec<Job<'_>>> {
        let mut jobs = Vec::new();
        for job_id in self.tracker.list_jobs().await? {
            if let Some(filter) = filter {
                match self.tracker.job_info(&job_id).await {
                    Ok(info) if matches_filter(&info, filter) => {}
                    Ok(_) | Err(JobError::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                }
            }
            let template = self.template_of(&job_id).await;
            jobs.push(Job::new(job_id, &self.name, template, self.tracker(), false));
        }
        Ok(jobs)
    }

    /// Handle to an existing array job.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for unknown array ids.
    pub async fn job_array(&self, array_id: &str) -> Result<JobArray<'_>> {
        let task_ids = self.tracker.list_array_jobs(array_id).await?;
        let template = self.template_of(array_id).await;
        let jobs = task_ids
            .into_iter()
            .map(|id| Job::new(id, &self.name, template.clone(), self.tracker(), false))
            .collect();
        Ok(JobArray::new(array_id, &self.name, template, jobs))
    }

    /// Categories the backend understands.
    ///
    /// # Errors
    ///
    /// Propagates tracker errors.
    pub async fn job_categories(&self) -> Result<Vec<String>> {
        self.tracker.list_job_categories().await
    }

    /// First of `jobs` to start.
    ///
    /// # Errors
    ///
    /// See [`wait_any`].
    pub async fn wait_any_started<'s>(
        &'s self,
        jobs: &[Job<'s>],
        timeout: Duration,
    ) -> Result<Job<'s>> {
        wait_any(true, jobs, timeout).await
    }

    /// First of `jobs` to terminate.
    ///
    /// # Errors
    ///
    /// See [`wait_any`].
    pub async fn wait_any_terminated<'s>(
        &'s self,
        jobs: &[Job<'s>],
        timeout: Duration,
    ) -> Result<Job<'s>> {
        wait_any(false, jobs, timeout).await
    }

    /// Release backend resources; a backend without close support is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates the backend's error.
    pub async fn close(&self) -> Result<()> {
        if let Some(closer) = self.tracker.as_session_closer() {
            closer.close().await?;
        }
        info!(session = %self.name, "Job session closed");
        Ok(())
    }
}

impl fmt::Debug for JobSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobSession")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
