//! Job template submitted by callers.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};

/// Sentinel path for the caller's standard input.
pub const STDIN_PATH: &str = "/dev/stdin";
/// Sentinel path for the caller's standard output.
pub const STDOUT_PATH: &str = "/dev/stdout";
/// Sentinel path for the caller's standard error.
pub const STDERR_PATH: &str = "/dev/stderr";

/// Extension key selecting a new filesystem root for the job process.
pub const EXTENSION_CHROOT: &str = "chroot";

/// Description of the work to submit.
///
/// Backends ignore fields they cannot honor but never rewrite the ones
/// they do honor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobTemplate {
    /// Executable to run.
    pub remote_command: String,
    /// Arguments passed to the command.
    pub args: Vec<String>,
    /// Human readable name.
    pub job_name: String,
    /// Working directory of the job; empty keeps the tracker's default.
    pub working_directory: String,
    /// Path for standard input; empty means `/dev/null`.
    pub input_path: String,
    /// Path for standard output; empty means `/dev/null`.
    pub output_path: String,
    /// Path for standard error; empty means `/dev/null`.
    pub error_path: String,
    /// Send standard error to the output path.
    pub join_files: bool,
    /// Environment variables added to the inherited environment.
    pub job_environment: BTreeMap<String, String>,
    /// Backend specific options.
    pub extension: BTreeMap<String, String>,
    /// Category used by backends to pick an execution environment.
    pub job_category: String,
    /// Queue requested from cluster backends.
    pub queue_name: String,
    /// Minimum slot count.
    pub min_slots: u64,
    /// Maximum slot count.
    pub max_slots: u64,
    /// Hosts the job may run on.
    pub candidate_machines: Vec<String>,
    /// Scheduling priority.
    pub priority: i64,
    /// Accounting string.
    pub accounting_id: String,
    /// Files copied to the execution host before the job runs.
    pub stage_in_files: BTreeMap<String, String>,
    /// Files copied back once the job finished.
    pub stage_out_files: BTreeMap<String, String>,
}

impl JobTemplate {
    /// Template running `command` with `args`.
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            remote_command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Reject templates no backend can run.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::InvalidArgument`] when the command is empty.
    pub fn validate(&self) -> Result<()> {
        if self.remote_command.trim().is_empty() {
            return Err(JobError::InvalidArgument(
                "job template has no command".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether two templates agree on the fields every backend must keep.
    #[must_use]
    pub fn same_submission(&self, other: &Self) -> bool {
        self.remote_command == other.remote_command
            && self.args == other.args
            && self.job_category == other.job_category
    }
}
