//! Job information and monitoring records.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::JobState;

/// Runtime information about a job, produced lazily by a tracker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobInfo {
    /// Job id (`<id>` or `<arrayid>.<index>`).
    pub id: String,
    /// Current state.
    pub state: JobState,
    /// Backend specific sub state.
    pub sub_state: String,
    /// Exit status once the job finished normally.
    pub exit_status: Option<i32>,
    /// Name of the signal that terminated the job.
    pub terminating_signal: Option<String>,
    /// Free-form diagnostic text.
    pub annotation: String,
    /// When the job was accepted.
    pub submission_time: Option<DateTime<Utc>>,
    /// When the job started executing.
    pub dispatch_time: Option<DateTime<Utc>>,
    /// When the job finished.
    pub finish_time: Option<DateTime<Utc>>,
    /// Wall clock time between dispatch and finish.
    pub wallclock_time: Duration,
    /// User plus system CPU time.
    pub cpu_time: Duration,
    /// Owner of the job.
    pub job_owner: String,
    /// Hosts the job was allocated to.
    pub allocated_machines: Vec<String>,
    /// Number of slots used.
    pub slots: u64,
    /// Queue the job ran in.
    pub queue_name: String,
    /// Backend specific fields (resource usage, diagnostics).
    pub extensions: BTreeMap<String, String>,
}

impl JobInfo {
    /// Minimal info for a job in `state`.
    pub fn new(id: impl Into<String>, state: JobState) -> Self {
        Self {
            id: id.into(),
            state,
            ..Self::default()
        }
    }

    /// Carry fields that must never change over from an earlier snapshot.
    ///
    /// Submission and dispatch time are fixed once recorded; other fields
    /// fall back to the previous value when the newer snapshot lacks them.
    pub fn inherit_from(&mut self, previous: &JobInfo) {
        if previous.submission_time.is_some() {
            self.submission_time = previous.submission_time;
        }
        if previous.dispatch_time.is_some() {
            self.dispatch_time = previous.dispatch_time;
        }
        if self.finish_time.is_none() {
            self.finish_time = previous.finish_time;
        }
        if self.exit_status.is_none() {
            self.exit_status = previous.exit_status;
        }
        if self.terminating_signal.is_none() {
            self.terminating_signal.clone_from(&previous.terminating_signal);
        }
        if self.job_owner.is_empty() {
            self.job_owner.clone_from(&previous.job_owner);
        }
        if self.allocated_machines.is_empty() {
            self.allocated_machines.clone_from(&previous.allocated_machines);
        }
        if self.slots == 0 {
            self.slots = previous.slots;
        }
        if self.queue_name.is_empty() {
            self.queue_name.clone_from(&previous.queue_name);
        }
        for (key, value) in &previous.extensions {
            self.extensions
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
    }
}

/// A queue offered by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    /// Queue name.
    pub name: String,
}

/// An execution host known to a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Machine {
    /// Host name.
    pub name: String,
    /// Operating system family.
    pub os: String,
    /// CPU architecture.
    pub arch: String,
    /// Logical CPUs.
    pub cpus: u64,
}
