//! Keyed storage of job templates and per-task runtime records.
//!
//! Two interchangeable implementations share [`JobStore`]:
//! - [`MemoryJobStore`]: map backed, lost on exit
//! - [`PersistentJobStore`]: redb backed, survives a crash of the tracker

mod memory;
mod persistent;

use chrono::{DateTime, Utc};
use jobkit_core::{JobError, JobInfo, JobState, JobTemplate, Result};
use serde::{Deserialize, Serialize};

pub use memory::MemoryJobStore;
pub use persistent::PersistentJobStore;

/// Runtime record of one task (task 0 for a singular job).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InternalJob {
    /// Task index; 0 for a singular job.
    pub task_id: u64,
    /// Last known state.
    pub state: JobState,
    /// OS process id; 0 while the task has not been started.
    pub pid: u32,
    /// When the task was accepted.
    pub submission_time: Option<DateTime<Utc>>,
    /// When the process was started.
    pub dispatch_time: Option<DateTime<Utc>>,
    /// When the process finished.
    pub finish_time: Option<DateTime<Utc>>,
    /// Exit status of a finished process.
    pub exit_status: Option<i32>,
    /// Signal that killed the process.
    pub terminating_signal: Option<String>,
}

impl InternalJob {
    /// A freshly submitted task.
    #[must_use]
    pub fn queued(task_id: u64, pid: u32, submitted: DateTime<Utc>) -> Self {
        Self {
            task_id,
            state: JobState::Queued,
            pid,
            submission_time: Some(submitted),
            dispatch_time: None,
            finish_time: None,
            exit_status: None,
            terminating_signal: None,
        }
    }

    /// Fold a state change into the record; recorded times are never replaced
    /// and a terminal state is never left.
    pub fn record(&mut self, state: JobState, info: &JobInfo) {
        if self.state.is_terminal() && !state.is_terminal() {
            return;
        }
        self.state = state;
        if self.submission_time.is_none() {
            self.submission_time = info.submission_time;
        }
        if self.dispatch_time.is_none() {
            self.dispatch_time = info.dispatch_time;
        }
        if info.finish_time.is_some() {
            self.finish_time = info.finish_time;
        }
        if info.exit_status.is_some() {
            self.exit_status = info.exit_status;
        }
        if info.terminating_signal.is_some() {
            self.terminating_signal.clone_from(&info.terminating_signal);
        }
    }

    /// Job info reconstructed from the persisted fields.
    #[must_use]
    pub fn to_info(&self, job_id: &str) -> JobInfo {
        let mut info = JobInfo::new(job_id, self.state);
        info.submission_time = self.submission_time;
        info.dispatch_time = self.dispatch_time;
        info.finish_time = self.finish_time;
        info.exit_status = self.exit_status;
        info.terminating_signal.clone_from(&self.terminating_signal);
        if let (Some(start), Some(end)) = (self.dispatch_time, self.finish_time) {
            info.wallclock_time = (end - start).to_std().unwrap_or_default();
        }
        info
    }
}

/// Storage contract shared by the in-memory and persistent stores.
pub trait JobStore: Send + Sync {
    /// Create a singular job record, or update the pid of an existing one.
    fn save_job(&self, job_id: &str, template: &JobTemplate, pid: u32) -> Result<()>;

    /// Create an array job with one record per task in `begin..=end` by `step`.
    fn save_array_job(
        &self,
        array_id: &str,
        pids: &[u32],
        template: &JobTemplate,
        begin: u64,
        end: u64,
        step: u64,
    ) -> Result<()>;

    /// Record the pid of a started array task.
    fn save_array_job_pid(&self, array_id: &str, task_id: u64, pid: u32) -> Result<()>;

    /// Persist the latest state of `job_id` (bare or dotted).
    fn save_job_state(&self, job_id: &str, state: JobState, info: &JobInfo) -> Result<()>;

    /// Whether the (bare or dotted) id is stored.
    fn has_job(&self, job_id: &str) -> bool;

    /// Whether the bare id belongs to an array job.
    fn is_array_job(&self, job_id: &str) -> bool;

    /// Remove a job; an array id removes every task, a dotted id removes one task.
    fn remove_job(&self, job_id: &str) -> Result<()>;

    /// Pid of a bare id (its first task) or of a dotted `id.task`.
    fn get_pid(&self, job_id: &str) -> Result<u32>;

    /// Bare ids of every stored job, in submission order.
    fn get_job_ids(&self) -> Result<Vec<String>>;

    /// Dotted task ids of an array job.
    fn get_array_job_task_ids(&self, array_id: &str) -> Result<Vec<String>>;

    /// Runtime record of a bare or dotted id.
    fn get_job_record(&self, job_id: &str) -> Result<InternalJob>;

    /// Template the job was submitted with.
    fn get_job_template(&self, job_id: &str) -> Result<JobTemplate>;

    /// Release the underlying storage.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Split `"12.3"` into `("12", Some(3))` and `"12"` into `("12", None)`.
///
/// # Errors
///
/// Returns [`JobError::InvalidArgument`] when the task part is not a number.
pub fn split_job_id(job_id: &str) -> Result<(&str, Option<u64>)> {
    match job_id.split_once('.') {
        None => Ok((job_id, None)),
        Some((base, task)) => task
            .parse::<u64>()
            .map(|task| (base, Some(task)))
            .map_err(|_| JobError::InvalidArgument(format!("malformed task id '{job_id}'"))),
    }
}

/// Task id of one array task.
#[must_use]
pub fn task_job_id(array_id: &str, task_id: u64) -> String {
    format!("{array_id}.{task_id}")
}

/// Task indices of `begin..=end` by `step`.
#[must_use]
pub fn task_indices(begin: u64, end: u64, step: u64) -> Vec<u64> {
    if step == 0 || begin > end {
        return Vec::new();
    }
    let step = usize::try_from(step).unwrap_or(usize::MAX);
    (begin..=end).step_by(step).collect()
}

fn array_records(pids: &[u32], begin: u64, end: u64, step: u64) -> Vec<InternalJob> {
    let now = Utc::now();
    task_indices(begin, end, step)
        .into_iter()
        .enumerate()
        .map(|(i, task)| InternalJob::queued(task, pids.get(i).copied().unwrap_or(0), now))
        .collect()
}

fn find_record<'a>(job_id: &str, records: &'a [InternalJob]) -> Result<&'a InternalJob> {
    let (_, task) = split_job_id(job_id)?;
    let found = match task {
        None => records.first(),
        Some(task) => records.iter().find(|r| r.task_id == task),
    };
    found.ok_or_else(|| JobError::unknown_job(job_id))
}

fn find_record_mut<'a>(
    job_id: &str,
    records: &'a mut [InternalJob],
) -> Result<&'a mut InternalJob> {
    let (_, task) = split_job_id(job_id)?;
    let found = match task {
        None => records.first_mut(),
        Some(task) => records.iter_mut().find(|r| r.task_id == task),
    };
    found.ok_or_else(|| JobError::unknown_job(job_id))
}

fn sort_job_ids(ids: &mut [String]) {
    ids.sort_by(|a, b| match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    });
}
