//! Process supervisor: starts one OS process per job and reports its fate.
//!
//! Every process runs in its own process group so control signals reach the
//! whole tree. Supervision runs on a blocking thread that reaps the process
//! with `wait4`, which also yields resource usage.
//!
//! Children belong to the OS process, not to a tracker: a supervisor that
//! outlives its tracker's event bus leaves the outcome in a process-wide
//! child table, where a tracker reopened over the same store picks it up.

use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobkit_core::{
    EXTENSION_CHROOT, JobError, JobInfo, JobState, JobTemplate, Result, STDERR_PATH, STDIN_PATH,
    STDOUT_PATH,
};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventSender, JobEvent};

/// Environment variable carrying the job id into the process.
pub const ENV_JOB_ID: &str = "JOB_ID";
/// Environment variable carrying the array task index (0 for singular jobs).
pub const ENV_TASK_ID: &str = "TASK_ID";

#[derive(Default)]
struct ChildTable {
    /// Pids a supervision thread is still waiting on.
    supervised: HashSet<u32>,
    /// Outcomes reaped after the owning event bus stopped.
    orphaned: HashMap<u32, JobInfo>,
}

static CHILDREN: OnceLock<Mutex<ChildTable>> = OnceLock::new();

fn children() -> MutexGuard<'static, ChildTable> {
    CHILDREN
        .get_or_init(Mutex::default)
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

/// What this process knows about a pid started by an earlier tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChildFate {
    /// A supervision thread still waits on it and will report its outcome.
    Supervised,
    /// It finished after its tracker closed; taking the outcome consumes it.
    Finished(JobInfo),
    /// Not a child this process supervised.
    Unknown,
}

pub(crate) fn child_fate(pid: u32) -> ChildFate {
    let mut table = children();
    if let Some(info) = table.orphaned.remove(&pid) {
        ChildFate::Finished(info)
    } else if table.supervised.contains(&pid) {
        ChildFate::Supervised
    } else {
        ChildFate::Unknown
    }
}

/// Host name of this machine, empty when it cannot be determined.
pub(crate) fn local_hostname() -> String {
    nix::unistd::gethostname()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Start the process described by `template` and supervise it.
///
/// Publishes Running as soon as the process exists; the terminal event
/// follows from the supervision thread once the process is reaped and its
/// redirected output reached the disk.
///
/// # Errors
///
/// - [`JobError::InvalidArgument`] for a template without a command
/// - [`JobError::Internal`] when a redirection cannot be opened or the
///   process cannot be spawned
pub fn start_process(
    job_id: &str,
    task_id: u64,
    template: &JobTemplate,
    events: &EventSender,
) -> Result<u32> {
    template.validate()?;
    let redirect = Redirections::open(template).map_err(|e| JobError::internal(job_id, "redirect", e))?;

    let mut command = Command::new(&template.remote_command);
    command
        .args(&template.args)
        .envs(&template.job_environment)
        .env(ENV_JOB_ID, job_id)
        .env(ENV_TASK_ID, task_id.to_string())
        .stdin(redirect.stdin)
        .stdout(redirect.stdout)
        .stderr(redirect.stderr)
        .process_group(0);

    match template
        .extension
        .get(EXTENSION_CHROOT)
        .filter(|root| !root.is_empty())
    {
        Some(root) => apply_chroot(&mut command, root, &template.working_directory),
        None if !template.working_directory.is_empty() => {
            command.current_dir(&template.working_directory);
        }
        None => {}
    }

    let child = command
        .spawn()
        .map_err(|e| JobError::internal(job_id, "start", e))?;
    let pid = child.id();
    drop(child);
    children().supervised.insert(pid);

    let dispatched = Utc::now();
    let mut running = JobInfo::new(job_id, JobState::Running);
    running.dispatch_time = Some(dispatched);
    running.allocated_machines = vec![local_hostname()];
    running.slots = 1;
    events.publish(JobEvent::new(job_id, JobState::Running, running));
    info!(job_id, task_id, pid, "Started job process");

    let job_id = job_id.to_string();
    let events = events.clone();
    let outputs = redirect.sync_files;
    tokio::task::spawn_blocking(move || supervise(&job_id, pid, dispatched, &outputs, &events));

    Ok(pid)
}

#[allow(unsafe_code)]
fn apply_chroot(command: &mut Command, root: &str, working_directory: &str) {
    let root = PathBuf::from(root);
    let workdir = if working_directory.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(working_directory)
    };
    // SAFETY: the hook only issues chroot(2) and chdir(2) on paths prepared
    // before the fork.
    unsafe {
        command.pre_exec(move || {
            nix::unistd::chroot(root.as_path()).map_err(io::Error::from)?;
            nix::unistd::chdir(workdir.as_path()).map_err(io::Error::from)?;
            Ok(())
        });
    }
}

struct Redirections {
    stdin: Stdio,
    stdout: Stdio,
    stderr: Stdio,
    /// Handles of redirected output files, synced before the job is reported finished.
    sync_files: Vec<File>,
}

impl Redirections {
    fn open(template: &JobTemplate) -> io::Result<Self> {
        let stdin = match template.input_path.as_str() {
            "" => Stdio::null(),
            STDIN_PATH => Stdio::inherit(),
            path => Stdio::from(File::open(path)?),
        };

        let (stdout, out_file) = output_target(&template.output_path)?;
        let (stderr, err_file) = match (&out_file, template.join_files) {
            // Both streams share one open file description.
            (Some(file), true) => (Stdio::from(file.try_clone()?), None),
            (None, true) => output_target(&template.output_path)?,
            (_, false) => output_target(&template.error_path)?,
        };

        Ok(Self {
            stdin,
            stdout,
            stderr,
            sync_files: out_file.into_iter().chain(err_file).collect(),
        })
    }
}

fn output_target(path: &str) -> io::Result<(Stdio, Option<File>)> {
    match path {
        "" => Ok((Stdio::null(), None)),
        STDOUT_PATH => Ok((Stdio::from(io::stdout()), None)),
        STDERR_PATH => Ok((Stdio::from(io::stderr()), None)),
        path => {
            let file = File::create(path)?;
            Ok((Stdio::from(file.try_clone()?), Some(file)))
        }
    }
}

fn supervise(
    job_id: &str,
    pid: u32,
    dispatched: DateTime<Utc>,
    outputs: &[File],
    events: &EventSender,
) {
    let result = wait_with_rusage(pid);
    for file in outputs {
        if let Err(e) = file.sync_all() {
            warn!(job_id, pid, error = %e, "Failed to flush job output");
        }
    }

    let event = match result {
        Ok((status, usage)) => {
            let mut info = finished_info(job_id, status);
            info.dispatch_time = Some(dispatched);
            if let Some(finished) = info.finish_time {
                info.wallclock_time = (finished - dispatched).to_std().unwrap_or_default();
            }
            apply_rusage(&mut info, &usage);
            JobEvent::new(job_id, info.state, info)
        }
        Err(e) => {
            warn!(job_id, pid, error = %e, "Cannot wait for job process");
            let mut event = JobEvent::minimal(job_id, JobState::Failed);
            event.info.annotation = format!("cannot wait for process {pid}: {e}");
            event
        }
    };

    info!(
        job_id,
        pid,
        state = %event.state,
        exit_status = ?event.info.exit_status,
        signal = ?event.info.terminating_signal,
        "Job process finished"
    );

    let mut table = children();
    table.supervised.remove(&pid);
    if let Err(event) = events.try_publish(event) {
        debug!(job_id, pid, "Event bus is gone; keeping the outcome for a reopened tracker");
        table.orphaned.insert(pid, event.info);
    }
}

#[allow(unsafe_code)]
fn wait_with_rusage(pid: u32) -> io::Result<(WaitStatus, libc::rusage)> {
    let raw_pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; all-zero is a valid value.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both out pointers refer to live, writable locals.
        let reaped = unsafe { libc::wait4(raw_pid, &raw mut status, 0, &raw mut usage) };
        if reaped == raw_pid {
            break;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
    let status = WaitStatus::from_raw(Pid::from_raw(raw_pid), status).map_err(io::Error::from)?;
    Ok((status, usage))
}

/// Terminal info derived from how the process ended.
fn finished_info(job_id: &str, status: WaitStatus) -> JobInfo {
    let mut info = JobInfo::new(job_id, JobState::Failed);
    info.finish_time = Some(Utc::now());
    match status {
        WaitStatus::Exited(_, code) => {
            info.exit_status = Some(code);
            if code == 0 {
                info.state = JobState::Done;
            }
        }
        WaitStatus::Signaled(_, signal, core_dumped) => {
            info.terminating_signal = Some(signal.as_str().to_string());
            if core_dumped {
                info.extensions
                    .insert("core_dumped".to_string(), "true".to_string());
            }
        }
        other => {
            info.annotation = format!("unexpected wait status {other:?}");
        }
    }
    info
}

fn timeval_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or(0);
    let micros = u64::try_from(tv.tv_usec).unwrap_or(0);
    Duration::from_secs(secs) + Duration::from_micros(micros)
}

fn apply_rusage(info: &mut JobInfo, usage: &libc::rusage) {
    info.cpu_time = timeval_duration(usage.ru_utime) + timeval_duration(usage.ru_stime);
    for (key, value) in [
        ("ru_maxrss", usage.ru_maxrss),
        ("ru_nswap", usage.ru_nswap),
        ("ru_inblock", usage.ru_inblock),
        ("ru_oublock", usage.ru_oublock),
        ("ru_minflt", usage.ru_minflt),
        ("ru_majflt", usage.ru_majflt),
        ("ru_nvcsw", usage.ru_nvcsw),
        ("ru_nivcsw", usage.ru_nivcsw),
    ] {
        info.extensions.insert(key.to_string(), value.to_string());
    }
}

/// Flush the files a template redirects into, if they exist.
fn sync_template_outputs(job_id: &str, template: &JobTemplate) {
    let paths = [template.output_path.as_str(), template.error_path.as_str()];
    for path in paths {
        if path.is_empty() || path == STDOUT_PATH || path == STDERR_PATH {
            continue;
        }
        match File::open(path).and_then(|file| file.sync_all()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(job_id, path, error = %e, "Failed to flush recovered job output"),
        }
    }
}

/// Follow a process that survived a tracker restart.
///
/// A process still supervised by an earlier tracker in this process reports
/// through the child table. A child nobody waits on is reaped with `waitpid`;
/// otherwise liveness is checked with signal 0 and the job is reported
/// Failed once the process is gone, since its exit status is lost.
pub fn track_recovered(
    job_id: String,
    pid: u32,
    template: JobTemplate,
    events: EventSender,
    poll_interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(raw_pid) = i32::try_from(pid) else {
            warn!(job_id = %job_id, pid, "Recovered pid out of range");
            events.publish(JobEvent::minimal(job_id, JobState::Failed));
            return;
        };
        let pid_handle = Pid::from_raw(raw_pid);
        let mut ticker = tokio::time::interval(poll_interval);
        debug!(job_id = %job_id, pid, "Tracking recovered job process");

        let event = loop {
            ticker.tick().await;
            match child_fate(pid) {
                ChildFate::Finished(info) => break JobEvent::new(job_id.as_str(), info.state, info),
                ChildFate::Supervised => continue,
                ChildFate::Unknown => {}
            }
            match waitpid(pid_handle, Some(WaitPidFlag::WNOHANG)) {
                Ok(status @ (WaitStatus::Exited(..) | WaitStatus::Signaled(..))) => {
                    break JobEvent::new(job_id.as_str(), state_of(status), finished_info(&job_id, status));
                }
                Ok(_) => {}
                Err(Errno::ECHILD) => match kill(pid_handle, None) {
                    Ok(()) | Err(Errno::EPERM) => {}
                    Err(_) => {
                        let mut event = JobEvent::minimal(job_id.as_str(), JobState::Failed);
                        event.info.finish_time = Some(Utc::now());
                        event.info.annotation =
                            format!("process {pid} exited while not supervised; exit status unknown");
                        break event;
                    }
                },
                Err(e) => {
                    warn!(job_id = %job_id, pid, error = %e, "Cannot poll recovered job process");
                    let mut event = JobEvent::minimal(job_id.as_str(), JobState::Failed);
                    event.info.annotation = format!("cannot poll process {pid}: {e}");
                    break event;
                }
            }
        };

        sync_template_outputs(&job_id, &template);
        info!(job_id = %job_id, pid, state = %event.state, "Recovered job process finished");
        events.publish(event);
    })
}

fn state_of(status: WaitStatus) -> JobState {
    match status {
        WaitStatus::Exited(_, 0) => JobState::Done,
        _ => JobState::Failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::Signal;

    #[test]
    fn test_finished_info_from_exit_codes() {
        let pid = Pid::from_raw(1);
        let done = finished_info("1", WaitStatus::Exited(pid, 0));
        assert_eq!(done.state, JobState::Done);
        assert_eq!(done.exit_status, Some(0));

        let failed = finished_info("1", WaitStatus::Exited(pid, 3));
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.exit_status, Some(3));
    }

    #[test]
    fn test_finished_info_from_signal() {
        let info = finished_info(
            "1",
            WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false),
        );
        assert_eq!(info.state, JobState::Failed);
        assert_eq!(info.terminating_signal.as_deref(), Some("SIGKILL"));
        assert_eq!(info.exit_status, None);
    }

    #[test]
    fn test_timeval_duration() {
        let tv = libc::timeval {
            tv_sec: 2,
            tv_usec: 500_000,
        };
        assert_eq!(timeval_duration(tv), Duration::from_millis(2500));
    }

    #[test]
    fn test_orphaned_outcome_is_taken_once() {
        let pid = u32::MAX - 7;
        assert_eq!(child_fate(pid), ChildFate::Unknown);

        children().supervised.insert(pid);
        assert_eq!(child_fate(pid), ChildFate::Supervised);

        let done = finished_info("1", WaitStatus::Exited(Pid::from_raw(1), 0));
        {
            let mut table = children();
            table.supervised.remove(&pid);
            table.orphaned.insert(pid, done.clone());
        }
        assert_eq!(child_fate(pid), ChildFate::Finished(done));
        assert_eq!(child_fate(pid), ChildFate::Unknown);
    }
}
