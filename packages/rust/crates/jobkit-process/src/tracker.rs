//! `ProcessTracker`: runs jobs as local OS processes.
//!
//! Composes the job store, the event bus and the process supervisor.
//! The dispatch mutex covers id allocation, the pid table and the
//! start/terminate handshake; spawning and store writes happen outside it.
//! Lock order: dispatch mutex, then the bus mutex. No mutex is held across
//! an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use jobkit_core::{
    JobAction, JobError, JobInfo, JobState, JobTemplate, JobTemplater, JobTracker, Machine,
    Monitorer, Queue, Result, SessionCloser,
};
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use tokio::sync::{Semaphore, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ProcessTrackerConfig;
use crate::events::{EventBus, JobEvent, Registration};
use crate::store::{
    JobStore, MemoryJobStore, PersistentJobStore, split_job_id, task_indices, task_job_id,
};
use crate::supervisor::{ChildFate, child_fate, local_hostname, start_process, track_recovered};

/// Successor of `last` in the id sequence; wraps to 1, never yields 0.
#[must_use]
pub fn next_job_id(last: u64) -> u64 {
    if last == u64::MAX { 1 } else { last + 1 }
}

#[derive(Default)]
struct Dispatch {
    last_id: u64,
    /// Pids of started jobs and array tasks.
    pids: HashMap<String, u32>,
    /// Jobs being spawned; `true` once termination was requested meanwhile.
    starting: HashMap<String, bool>,
}

struct Shared {
    dispatch: Mutex<Dispatch>,
    bus: EventBus,
    store: Arc<dyn JobStore>,
}

impl Shared {
    fn lock_dispatch(&self) -> MutexGuard<'_, Dispatch> {
        self.dispatch.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Next free id; ids still held by the store after a wrap are skipped.
    fn allocate_id(&self, dispatch: &mut Dispatch) -> String {
        loop {
            dispatch.last_id = next_job_id(dispatch.last_id);
            let candidate = dispatch.last_id.to_string();
            if !self.store.has_job(&candidate) {
                return candidate;
            }
        }
    }

    fn fail(&self, job_id: &str, annotation: String) {
        let mut event = JobEvent::minimal(job_id, JobState::Failed);
        event.info.finish_time = Some(Utc::now());
        event.info.annotation = annotation;
        self.bus.record(event);
    }

    /// Spawn a job already claimed in `starting`. A termination requested
    /// during the spawn is delivered as soon as the pid is known.
    fn spawn(&self, job_id: &str, task: u64, template: &JobTemplate) -> Result<u32> {
        let started = start_process(job_id, task, template, &self.bus.sender());
        let cancelled = {
            let mut dispatch = self.lock_dispatch();
            if let Ok(pid) = &started {
                dispatch.pids.insert(job_id.to_string(), *pid);
            }
            dispatch.starting.remove(job_id).unwrap_or(false)
        };

        match started {
            Ok(pid) => {
                if cancelled {
                    info!(job_id, pid, "Delivering termination requested during start");
                    if let Err(e) = signal_group(pid, Signal::SIGKILL)
                        && e != Errno::ESRCH
                    {
                        warn!(job_id, pid, error = %e, "Failed to terminate freshly started job");
                    }
                }
                Ok(pid)
            }
            Err(e) => {
                warn!(job_id, error = %e, "Job failed to start");
                self.fail(job_id, e.to_string());
                Err(e)
            }
        }
    }

    /// Start one array task unless it was terminated while queued.
    fn launch_task(
        &self,
        array_id: &str,
        task: u64,
        task_id: &str,
        template: &JobTemplate,
    ) -> Result<bool> {
        {
            let mut dispatch = self.lock_dispatch();
            if self.bus.state(task_id).is_none_or(JobState::is_terminal) {
                debug!(job_id = task_id, "Skipping array task terminated before dispatch");
                return Ok(false);
            }
            dispatch.starting.insert(task_id.to_string(), false);
        }
        let pid = self.spawn(task_id, task, template)?;
        self.store.save_array_job_pid(array_id, task, pid)?;
        Ok(true)
    }

    /// Forget a job whose id was never handed out; waiters already saw Failed.
    fn discard(&self, job_id: &str) {
        self.lock_dispatch().pids.remove(job_id);
        if let Err(e) = self.store.remove_job(job_id) {
            warn!(job_id, error = %e, "Failed to remove job that never started");
        }
        self.bus.unregister(job_id);
    }

    /// Fail every not yet terminal task and drop the array's bookkeeping.
    fn abort_array(&self, array_id: &str, task_ids: &[String]) {
        {
            let mut dispatch = self.lock_dispatch();
            for task_id in task_ids {
                dispatch.pids.remove(task_id);
                if !self.bus.state(task_id).is_some_and(JobState::is_terminal) {
                    self.fail(task_id, "array submission aborted".to_string());
                }
            }
        }
        if let Err(e) = self.store.remove_job(array_id) {
            warn!(job_id = array_id, error = %e, "Failed to remove aborted array job");
        }
        for task_id in task_ids {
            self.bus.unregister(task_id);
        }
    }
}

/// Reference scheduler running each job as a local process group.
pub struct ProcessTracker {
    shared: Arc<Shared>,
    config: ProcessTrackerConfig,
    recovered: Mutex<Vec<JoinHandle<()>>>,
}

impl ProcessTracker {
    /// Tracker keeping its bookkeeping in memory.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Internal`] outside a tokio runtime.
    pub fn new() -> Result<Self> {
        Self::with_config(ProcessTrackerConfig::in_memory())
    }

    /// Tracker for `config`; a `db_path` selects the persistent store and
    /// recovers whatever a previous tracker left there.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Internal`] when the store cannot be opened or
    /// read, or outside a tokio runtime.
    pub fn with_config(config: ProcessTrackerConfig) -> Result<Self> {
        let store: Arc<dyn JobStore> = match &config.db_path {
            Some(path) => Arc::new(PersistentJobStore::open(path)?),
            None => Arc::new(MemoryJobStore::new()),
        };
        Self::with_store(store, config)
    }

    /// Tracker over an existing store.
    ///
    /// # Errors
    ///
    /// Same as [`with_config`](Self::with_config).
    pub fn with_store(store: Arc<dyn JobStore>, config: ProcessTrackerConfig) -> Result<Self> {
        let bus = EventBus::start(Arc::clone(&store))?;
        let tracker = Self {
            shared: Arc::new(Shared {
                dispatch: Mutex::new(Dispatch::default()),
                bus,
                store,
            }),
            config,
            recovered: Mutex::new(Vec::new()),
        };
        tracker.recover()?;
        Ok(tracker)
    }

    fn recover(&self) -> Result<()> {
        let shared = &self.shared;
        let job_ids = shared.store.get_job_ids()?;
        let mut last_id = 0;
        let mut pids = HashMap::new();
        let mut reattached = 0usize;

        for job_id in &job_ids {
            if let Ok(numeric) = job_id.parse::<u64>() {
                last_id = last_id.max(numeric);
            }
            let template = shared.store.get_job_template(job_id)?;
            let task_ids = if shared.store.is_array_job(job_id) {
                shared.store.get_array_job_task_ids(job_id)?
            } else {
                vec![job_id.clone()]
            };

            for task_id in task_ids {
                let record = shared.store.get_job_record(&task_id)?;
                shared.bus.seed(&task_id, record.to_info(&task_id));
                if record.state.is_terminal() {
                    continue;
                }
                if record.pid == 0 {
                    shared.fail(&task_id, "never dispatched before the tracker restarted".to_string());
                    continue;
                }
                pids.insert(task_id.clone(), record.pid);

                match child_fate(record.pid) {
                    ChildFate::Finished(info) => {
                        debug!(job_id = %task_id, pid = record.pid, state = %info.state, "Recovered job finished after its tracker closed");
                        shared
                            .bus
                            .record(JobEvent::new(task_id.as_str(), info.state, info));
                        continue;
                    }
                    ChildFate::Unknown if !process_alive(record.pid) => {
                        debug!(job_id = %task_id, pid = record.pid, state = %record.state, "Recovered job process is gone");
                        continue;
                    }
                    ChildFate::Supervised | ChildFate::Unknown => {}
                }

                // A stopped process group stays Suspended until resumed.
                let state = if record.state == JobState::Suspended {
                    JobState::Suspended
                } else {
                    JobState::Running
                };
                let mut live = record.to_info(&task_id);
                live.state = state;
                shared
                    .bus
                    .record(JobEvent::new(task_id.as_str(), state, live));
                let handle = track_recovered(
                    task_id.clone(),
                    record.pid,
                    template.clone(),
                    shared.bus.sender(),
                    self.config.recovery_poll_interval,
                );
                self.recovered
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(handle);
                reattached += 1;
            }
        }

        {
            let mut dispatch = shared.lock_dispatch();
            dispatch.last_id = last_id;
            dispatch.pids = pids;
        }
        if !job_ids.is_empty() {
            info!(
                jobs = job_ids.len(),
                reattached,
                last_id,
                "Recovered job bookkeeping"
            );
        }
        Ok(())
    }

    /// Configuration the tracker was built with.
    #[must_use]
    pub fn config(&self) -> &ProcessTrackerConfig {
        &self.config
    }

    fn submit_job(&self, template: &JobTemplate) -> Result<String> {
        template.validate()?;
        let shared = &self.shared;
        let job_id = {
            let mut dispatch = shared.lock_dispatch();
            let job_id = shared.allocate_id(&mut dispatch);
            dispatch.starting.insert(job_id.clone(), false);
            job_id
        };

        let placeholder = shared
            .store
            .save_job(&job_id, template, 0)
            .and_then(|()| shared.store.get_job_record(&job_id));
        let record = match placeholder {
            Ok(record) => record,
            Err(e) => {
                shared.lock_dispatch().starting.remove(&job_id);
                return Err(e);
            }
        };
        shared.bus.seed(&job_id, record.to_info(&job_id));

        match shared.spawn(&job_id, 0, template) {
            Ok(pid) => {
                shared.store.save_job(&job_id, template, pid)?;
                Ok(job_id)
            }
            Err(e) => {
                shared.discard(&job_id);
                Err(e)
            }
        }
    }

    fn submit_array(
        &self,
        template: &JobTemplate,
        begin: u64,
        end: u64,
        step: u64,
    ) -> Result<(String, Vec<u64>)> {
        template.validate()?;
        if begin == 0 || begin > end || step == 0 {
            return Err(JobError::InvalidArgument(format!(
                "invalid array range {begin}..={end} by {step}"
            )));
        }
        let tasks = task_indices(begin, end, step);

        let shared = &self.shared;
        let array_id = {
            let mut dispatch = shared.lock_dispatch();
            shared.allocate_id(&mut dispatch)
        };
        shared
            .store
            .save_array_job(&array_id, &[], template, begin, end, step)?;
        for &task in &tasks {
            let task_id = task_job_id(&array_id, task);
            let record = shared.store.get_job_record(&task_id)?;
            shared.bus.seed(&task_id, record.to_info(&task_id));
        }
        Ok((array_id, tasks))
    }

    fn control(&self, job_id: &str, action: JobAction) -> Result<()> {
        let shared = &self.shared;
        let mut dispatch = shared.lock_dispatch();
        let state = shared
            .bus
            .state(job_id)
            .ok_or_else(|| JobError::unknown_job(job_id))?;

        match action {
            JobAction::Hold | JobAction::Release => Err(JobError::UnsupportedOperation(format!(
                "{action} is not supported for process jobs"
            ))),
            JobAction::Terminate => {
                if state.is_terminal() {
                    return Ok(());
                }
                if let Some(pid) = dispatch.pids.get(job_id).copied() {
                    return match signal_group(pid, Signal::SIGKILL) {
                        Err(Errno::ESRCH) => Ok(()),
                        other => other.map_err(|e| JobError::internal(job_id, action.as_str(), e)),
                    };
                }
                if let Some(cancel) = dispatch.starting.get_mut(job_id) {
                    debug!(job_id, "Termination requested while the job starts");
                    *cancel = true;
                    return Ok(());
                }
                info!(job_id, "Terminating job before dispatch");
                shared.fail(job_id, "terminated before dispatch".to_string());
                Ok(())
            }
            JobAction::Suspend | JobAction::Resume => {
                if !matches!(state, JobState::Running | JobState::Suspended) {
                    return Err(JobError::InvalidState(format!(
                        "cannot {action} job {job_id} in state {state}"
                    )));
                }
                let pid = dispatch
                    .pids
                    .get(job_id)
                    .copied()
                    .ok_or_else(|| JobError::unknown_job(job_id))?;
                let (signal, next) = if action == JobAction::Suspend {
                    (Signal::SIGSTOP, JobState::Suspended)
                } else {
                    (Signal::SIGCONT, JobState::Running)
                };
                signal_group(pid, signal)
                    .map_err(|e| JobError::internal(job_id, action.as_str(), e))?;
                shared.bus.record(JobEvent::minimal(job_id, next));
                debug!(job_id, pid, state = %next, "Applied job control");
                Ok(())
            }
        }
    }

    fn delete(&self, job_id: &str) -> Result<()> {
        let shared = &self.shared;
        let (base, task) = split_job_id(job_id)?;
        let targets = if task.is_none() && shared.store.is_array_job(base) {
            shared.store.get_array_job_task_ids(base)?
        } else if shared.store.has_job(job_id) {
            vec![job_id.to_string()]
        } else {
            return Err(JobError::unknown_job(job_id));
        };

        {
            let mut dispatch = shared.lock_dispatch();
            for target in &targets {
                let state = shared.bus.state(target).unwrap_or_default();
                if !state.is_terminal() {
                    return Err(JobError::InvalidState(format!(
                        "job {target} is {state}; only finished jobs can be deleted"
                    )));
                }
            }
            for target in &targets {
                dispatch.pids.remove(target);
            }
        }

        shared.store.remove_job(job_id)?;
        for target in &targets {
            shared.bus.unregister(target);
        }
        debug!(job_id, tasks = targets.len(), "Deleted job");
        Ok(())
    }

    fn info_snapshot(&self, job_id: &str) -> Result<JobInfo> {
        let mut info = self
            .shared
            .bus
            .info(job_id)
            .ok_or_else(|| JobError::unknown_job(job_id))?;
        if matches!(info.state, JobState::Running | JobState::Suspended)
            && let Some(dispatched) = info.dispatch_time
        {
            info.wallclock_time = (Utc::now() - dispatched).to_std().unwrap_or_default();
        }
        if info.job_owner.is_empty() {
            info.job_owner = current_user();
        }
        if info.allocated_machines.is_empty() && info.dispatch_time.is_some() {
            info.allocated_machines = vec![local_hostname()];
        }
        Ok(info)
    }

    fn job_ids(&self) -> Result<Vec<String>> {
        let store = &self.shared.store;
        let mut ids = Vec::new();
        for job_id in store.get_job_ids()? {
            if store.is_array_job(&job_id) {
                ids.extend(store.get_array_job_task_ids(&job_id)?);
            } else {
                ids.push(job_id);
            }
        }
        Ok(ids)
    }
}

#[async_trait]
impl JobTracker for ProcessTracker {
    async fn list_jobs(&self) -> Result<Vec<String>> {
        self.job_ids()
    }

    async fn list_array_jobs(&self, array_id: &str) -> Result<Vec<String>> {
        self.shared.store.get_array_job_task_ids(array_id)
    }

    async fn add_job(&self, template: JobTemplate) -> Result<String> {
        let job_id = self.submit_job(&template)?;
        info!(job_id = %job_id, command = %template.remote_command, "Submitted job");
        Ok(job_id)
    }

    async fn add_array_job(
        &self,
        template: JobTemplate,
        begin: u64,
        end: u64,
        step: u64,
        max_parallel: u64,
    ) -> Result<String> {
        let (array_id, tasks) = self.submit_array(&template, begin, end, step)?;
        info!(
            job_id = %array_id,
            tasks = tasks.len(),
            max_parallel,
            "Submitted array job"
        );

        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(run_array(
            Arc::clone(&self.shared),
            array_id.clone(),
            template,
            tasks,
            max_parallel,
            first_tx,
        ));

        match first_rx.await {
            Ok(Ok(())) => Ok(array_id),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(JobError::internal(
                &array_id,
                "submit",
                "array controller stopped before the first task",
            )),
        }
    }

    async fn job_state(&self, job_id: &str) -> Result<(JobState, String)> {
        let state = self.shared.bus.state(job_id).unwrap_or_default();
        Ok((state, String::new()))
    }

    async fn job_info(&self, job_id: &str) -> Result<JobInfo> {
        self.info_snapshot(job_id)
    }

    async fn job_control(&self, job_id: &str, action: JobAction) -> Result<()> {
        self.control(job_id, action)
    }

    async fn wait(&self, job_id: &str, timeout: Duration, states: &[JobState]) -> Result<()> {
        self.shared.bus.wait(job_id, timeout, states).await.map(|_| ())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.delete(job_id)
    }

    async fn list_job_categories(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn as_job_templater(&self) -> Option<&dyn JobTemplater> {
        Some(self)
    }

    fn as_session_closer(&self) -> Option<&dyn SessionCloser> {
        Some(self)
    }

    fn as_monitorer(&self) -> Option<&dyn Monitorer> {
        Some(self)
    }
}

#[async_trait]
impl JobTemplater for ProcessTracker {
    async fn job_template(&self, job_id: &str) -> Result<JobTemplate> {
        self.shared.store.get_job_template(job_id)
    }
}

#[async_trait]
impl SessionCloser for ProcessTracker {
    async fn close(&self) -> Result<()> {
        let recovered: Vec<JoinHandle<()>> = self
            .recovered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for handle in recovered {
            handle.abort();
        }
        self.shared.bus.shutdown().await;
        self.shared.store.close()?;
        info!("Process tracker closed");
        Ok(())
    }
}

#[async_trait]
impl Monitorer for ProcessTracker {
    async fn all_jobs(&self) -> Result<Vec<JobInfo>> {
        let mut infos = Vec::new();
        for job_id in self.job_ids()? {
            match self.info_snapshot(&job_id) {
                Ok(info) => infos.push(info),
                Err(JobError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(infos)
    }

    async fn all_queues(&self, _names: &[String]) -> Result<Vec<Queue>> {
        Ok(Vec::new())
    }

    async fn all_machines(&self, names: &[String]) -> Result<Vec<Machine>> {
        let machine = local_machine();
        if names.is_empty() || names.contains(&machine.name) {
            Ok(vec![machine])
        } else {
            Ok(Vec::new())
        }
    }

    async fn job_info_by_id(&self, job_id: &str) -> Result<JobInfo> {
        self.info_snapshot(job_id)
    }
}

/// Walks the tasks of one array job, keeping at most `max_parallel`
/// running (0 means no limit). The first task's outcome answers `first`.
async fn run_array(
    shared: Arc<Shared>,
    array_id: String,
    template: JobTemplate,
    tasks: Vec<u64>,
    max_parallel: u64,
    first: oneshot::Sender<Result<()>>,
) {
    let limit = match usize::try_from(max_parallel) {
        Ok(0) => tasks.len(),
        Ok(limit) => limit.min(tasks.len()),
        Err(_) => tasks.len(),
    }
    .max(1);
    let semaphore = Arc::new(Semaphore::new(limit));
    let task_ids: Vec<String> = tasks
        .iter()
        .map(|&task| task_job_id(&array_id, task))
        .collect();
    let mut first = Some(first);

    for (&task, task_id) in tasks.iter().zip(&task_ids) {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };

        match shared.launch_task(&array_id, task, task_id, &template) {
            Ok(true) => match shared.bus.register(task_id, JobState::TERMINATED) {
                Ok(Registration::Pending(rx)) => {
                    tokio::spawn(async move {
                        let _ = rx.await;
                        drop(permit);
                    });
                }
                Ok(Registration::Ready(_)) | Err(_) => drop(permit),
            },
            Ok(false) => drop(permit),
            Err(e) => {
                drop(permit);
                if let Some(first) = first.take() {
                    warn!(job_id = %array_id, error = %e, "First array task failed; aborting array");
                    shared.abort_array(&array_id, &task_ids);
                    let _ = first.send(Err(e));
                    return;
                }
                warn!(job_id = %task_id, error = %e, "Array task failed to start");
            }
        }

        if let Some(first) = first.take() {
            let _ = first.send(Ok(()));
        }
    }
    debug!(job_id = %array_id, tasks = tasks.len(), "Array controller finished");
}

fn signal_group(pid: u32, signal: Signal) -> std::result::Result<(), Errno> {
    let pgid = i32::try_from(pid).map_err(|_| Errno::ESRCH)?;
    killpg(Pid::from_raw(pgid), signal)
}

fn process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    matches!(kill(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
}

fn current_user() -> String {
    let uid = nix::unistd::getuid();
    nix::unistd::User::from_uid(uid)
        .ok()
        .flatten()
        .map_or_else(|| uid.to_string(), |user| user.name)
}

fn local_machine() -> Machine {
    Machine {
        name: local_hostname(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
        cpus: std::thread::available_parallelism()
            .ok()
            .and_then(|n| u64::try_from(n.get()).ok())
            .unwrap_or(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_job_id_wraps_without_zero() {
        assert_eq!(next_job_id(0), 1);
        assert_eq!(next_job_id(41), 42);
        assert_eq!(next_job_id(u64::MAX - 1), u64::MAX);
        assert_eq!(next_job_id(u64::MAX), 1);
    }

    #[tokio::test]
    async fn test_allocate_skips_ids_still_stored() {
        let tracker = ProcessTracker::new().expect("tracker");
        let template = JobTemplate::new("/bin/true", Vec::<String>::new());
        tracker
            .shared
            .store
            .save_job("1", &template, 0)
            .expect("save");
        let mut dispatch = tracker.shared.lock_dispatch();
        dispatch.last_id = u64::MAX;
        assert_eq!(tracker.shared.allocate_id(&mut dispatch), "2");
    }

    #[test]
    fn test_local_machine_has_cpus() {
        let machine = local_machine();
        assert!(machine.cpus >= 1);
        assert_eq!(machine.os, std::env::consts::OS);
    }
}
