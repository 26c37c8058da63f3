//! Job state event bus.
//!
//! Supervisors publish [`JobEvent`]s into one unbounded channel. A single
//! book-keeping worker drains it in order and, under the bus mutex:
//! - fans the event out to waiters registered for the job
//! - caches the latest state and info (merged with the previous info)
//!
//! Store writes happen on a dedicated blocking journal task fed in the same
//! order, so no redb commit runs under the mutex or on a runtime thread.
//!
//! ```text
//! supervisor ─publish()─► mpsc ─► worker ─► apply() ─┬─► waiters (oneshot)
//!                                                    ├─► state/info cache
//!                                                    └─► journal ─► JobStore
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use jobkit_core::{JobError, JobInfo, JobState, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::store::JobStore;

/// State change of one job (or array task).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    /// Job id or `<arrayid>.<index>`.
    pub job_id: String,
    /// New state.
    pub state: JobState,
    /// Information gathered alongside the change.
    pub info: JobInfo,
}

impl JobEvent {
    /// Event carrying `info` for `job_id`.
    pub fn new(job_id: impl Into<String>, state: JobState, info: JobInfo) -> Self {
        Self {
            job_id: job_id.into(),
            state,
            info,
        }
    }

    /// Event with only the id and state filled in.
    pub fn minimal(job_id: impl Into<String>, state: JobState) -> Self {
        let job_id = job_id.into();
        let info = JobInfo::new(job_id.clone(), state);
        Self {
            job_id,
            state,
            info,
        }
    }
}

/// Outcome of [`EventBus::register`].
#[derive(Debug)]
pub enum Registration {
    /// The job already is in one of the requested states.
    Ready(JobState),
    /// Resolves with the next matching (or terminal) event.
    Pending(oneshot::Receiver<JobEvent>),
}

struct Waiter {
    states: Vec<JobState>,
    tx: oneshot::Sender<JobEvent>,
}

struct Tables {
    states: HashMap<String, JobState>,
    infos: HashMap<String, JobInfo>,
    waiters: HashMap<String, Vec<Waiter>>,
    /// Feeds the journal task; `None` once the bus is shut down.
    journal: Option<mpsc::UnboundedSender<JobEvent>>,
}

struct Inner {
    tables: Mutex<Tables>,
}

impl Inner {
    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, mut event: JobEvent) {
        let mut tables = self.tables();
        if let Some(current) = tables.states.get(&event.job_id).copied()
            && current.is_terminal()
        {
            debug!(
                job_id = %event.job_id,
                current = %current,
                dropped = %event.state,
                "Dropping event for terminated job"
            );
            return;
        }

        if let Some(previous) = tables.infos.get(&event.job_id) {
            event.info.inherit_from(previous);
        }
        event.info.id.clone_from(&event.job_id);
        event.info.state = event.state;

        if let Some(waiters) = tables.waiters.remove(&event.job_id) {
            let mut remaining = Vec::with_capacity(waiters.len());
            for waiter in waiters {
                if waiter.tx.is_closed() {
                    continue;
                }
                if event.state.is_terminal() || waiter.states.contains(&event.state) {
                    let _ = waiter.tx.send(event.clone());
                } else {
                    remaining.push(waiter);
                }
            }
            if !remaining.is_empty() {
                tables.waiters.insert(event.job_id.clone(), remaining);
            }
        }

        tables.states.insert(event.job_id.clone(), event.state);
        tables.infos.insert(event.job_id.clone(), event.info.clone());

        // Sent under the lock so the journal sees the cache's order.
        let unjournaled = match &tables.journal {
            Some(journal) => journal.send(event).err().map(|e| e.0),
            None => Some(event),
        };
        if let Some(event) = unjournaled {
            debug!(
                job_id = %event.job_id,
                state = %event.state,
                "Journal is closed, state kept in memory only"
            );
        }
    }
}

fn run_journal(store: &dyn JobStore, mut rx: mpsc::UnboundedReceiver<JobEvent>) {
    while let Some(event) = rx.blocking_recv() {
        match store.save_job_state(&event.job_id, event.state, &event.info) {
            Ok(()) => debug!(job_id = %event.job_id, state = %event.state, "Journaled job state"),
            Err(JobError::NotFound(_)) => {
                debug!(job_id = %event.job_id, "Job left the store before its state was journaled");
            }
            Err(e) => warn!(job_id = %event.job_id, error = %e, "Failed to journal job state"),
        }
    }
    debug!("Job journal stopped");
}

/// Cheap handle supervisors publish through.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl EventSender {
    /// Queue an event for the book-keeping worker.
    pub fn publish(&self, event: JobEvent) {
        if let Err(event) = self.try_publish(event) {
            debug!(
                job_id = %event.job_id,
                state = %event.state,
                "Event bus is shut down, event discarded"
            );
        }
    }

    /// Queue an event, handing it back when the bus no longer accepts events.
    ///
    /// # Errors
    ///
    /// Returns the event once the worker has stopped.
    pub fn try_publish(&self, event: JobEvent) -> std::result::Result<(), JobEvent> {
        self.tx
            .send(event)
            .map_err(|mpsc::error::SendError(event)| event)
    }
}

struct Worker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// Per-tracker pub/sub hub for job state changes.
pub struct EventBus {
    inner: Arc<Inner>,
    sender: EventSender,
    worker: Mutex<Option<Worker>>,
    journal: Mutex<Option<JoinHandle<()>>>,
}

impl EventBus {
    /// Start a bus journaling into `store`.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Internal`] when called outside a tokio runtime.
    pub fn start(store: Arc<dyn JobStore>) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| JobError::Internal(format!("event bus needs a tokio runtime: {e}")))?;

        let (journal_tx, journal_rx) = mpsc::unbounded_channel();
        let journal = runtime.spawn_blocking(move || run_journal(store.as_ref(), journal_rx));

        let inner = Arc::new(Inner {
            tables: Mutex::new(Tables {
                states: HashMap::new(),
                infos: HashMap::new(),
                waiters: HashMap::new(),
                journal: Some(journal_tx),
            }),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = runtime.spawn(run_worker(Arc::clone(&inner), rx, stop_rx));

        Ok(Self {
            inner,
            sender: EventSender { tx },
            worker: Mutex::new(Some(Worker {
                stop: stop_tx,
                handle,
            })),
            journal: Mutex::new(Some(journal)),
        })
    }

    /// Handle for publishing from supervisors.
    #[must_use]
    pub fn sender(&self) -> EventSender {
        self.sender.clone()
    }

    /// Queue an event for the worker.
    pub fn publish(&self, event: JobEvent) {
        self.sender.publish(event);
    }

    /// Apply an event synchronously, bypassing the channel. Only the
    /// in-memory update happens in the caller; the store write is queued.
    pub fn record(&self, event: JobEvent) {
        self.inner.apply(event);
    }

    /// Cache a state without journaling it (submission and recovery).
    pub fn seed(&self, job_id: &str, info: JobInfo) {
        let mut tables = self.inner.tables();
        tables.states.insert(job_id.to_string(), info.state);
        tables.infos.insert(job_id.to_string(), info);
    }

    /// Cached state of `job_id`.
    #[must_use]
    pub fn state(&self, job_id: &str) -> Option<JobState> {
        self.inner.tables().states.get(job_id).copied()
    }

    /// Cached info of `job_id`.
    #[must_use]
    pub fn info(&self, job_id: &str) -> Option<JobInfo> {
        self.inner.tables().infos.get(job_id).cloned()
    }

    /// Subscribe to `job_id` reaching one of `states`.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] when the bus never saw the job
    /// - [`JobError::InvalidState`] when the job already terminated in a
    ///   state outside `states`
    pub fn register(&self, job_id: &str, states: &[JobState]) -> Result<Registration> {
        let mut tables = self.inner.tables();
        let current = tables
            .states
            .get(job_id)
            .copied()
            .ok_or_else(|| JobError::unknown_job(job_id))?;
        if states.contains(&current) {
            return Ok(Registration::Ready(current));
        }
        if current.is_terminal() {
            return Err(unreachable_states(job_id, current, states));
        }

        let (tx, rx) = oneshot::channel();
        let waiters = tables.waiters.entry(job_id.to_string()).or_default();
        waiters.retain(|w| !w.tx.is_closed());
        waiters.push(Waiter {
            states: states.to_vec(),
            tx,
        });
        Ok(Registration::Pending(rx))
    }

    /// Wait until `job_id` is in one of `states`; a zero timeout waits forever.
    ///
    /// # Errors
    ///
    /// Besides the [`register`](Self::register) errors, returns
    /// [`JobError::Timeout`] when the timeout elapses and
    /// [`JobError::InvalidState`] when the job terminates in another state.
    pub async fn wait(
        &self,
        job_id: &str,
        timeout: Duration,
        states: &[JobState],
    ) -> Result<JobState> {
        let rx = match self.register(job_id, states)? {
            Registration::Ready(state) => return Ok(state),
            Registration::Pending(rx) => rx,
        };

        let received = if timeout.is_zero() {
            rx.await
        } else {
            tokio::time::timeout(timeout, rx).await.map_err(|_| {
                JobError::Timeout(format!(
                    "job {job_id} did not reach {} within {timeout:?}",
                    format_states(states)
                ))
            })?
        };
        let event = received.map_err(|_| {
            JobError::Internal(format!("event bus closed while waiting for job {job_id}"))
        })?;

        if states.contains(&event.state) {
            Ok(event.state)
        } else {
            Err(unreachable_states(job_id, event.state, states))
        }
    }

    /// Forget everything about `job_id`; pending waiters observe a closed channel.
    pub fn unregister(&self, job_id: &str) {
        let mut tables = self.inner.tables();
        tables.states.remove(job_id);
        tables.infos.remove(job_id);
        tables.waiters.remove(job_id);
    }

    /// Stop the worker after draining queued events, then wait until every
    /// state reached the store. Later calls are no-ops.
    pub async fn shutdown(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(worker) = worker else {
            return;
        };
        let _ = worker.stop.send(());
        if let Err(e) = worker.handle.await {
            error!(error = %e, "Event bus worker crashed");
        }

        drop(self.inner.tables().journal.take());
        let journal = self
            .journal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(journal) = journal
            && let Err(e) = journal.await
        {
            error!(error = %e, "Job journal crashed");
        }
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        if let Some(worker) = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = worker.stop.send(());
        }
    }
}

async fn run_worker(
    inner: Arc<Inner>,
    mut rx: mpsc::UnboundedReceiver<JobEvent>,
    mut stop: oneshot::Receiver<()>,
) {
    debug!("Event bus worker started");
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            event = rx.recv() => match event {
                Some(event) => inner.apply(event),
                None => break,
            },
        }
    }
    // Later publishes fail and come back to their sender.
    rx.close();
    while let Ok(event) = rx.try_recv() {
        inner.apply(event);
    }
    info!("Event bus worker stopped");
}

fn format_states(states: &[JobState]) -> String {
    let names: Vec<String> = states.iter().map(ToString::to_string).collect();
    format!("[{}]", names.join(", "))
}

fn unreachable_states(job_id: &str, current: JobState, states: &[JobState]) -> JobError {
    JobError::InvalidState(format!(
        "job {job_id} is {current} and can no longer reach {}",
        format_states(states)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryJobStore;
    use chrono::Utc;
    use jobkit_core::JobTemplate;

    fn bus_with_job(job_id: &str) -> (EventBus, Arc<MemoryJobStore>) {
        let store = Arc::new(MemoryJobStore::new());
        store
            .save_job(job_id, &JobTemplate::new("/bin/true", Vec::<String>::new()), 0)
            .expect("save");
        let bus = EventBus::start(store.clone()).expect("bus");
        bus.seed(job_id, JobInfo::new(job_id, JobState::Queued));
        (bus, store)
    }

    #[tokio::test]
    async fn test_terminal_state_is_sticky() {
        let (bus, store) = bus_with_job("1");
        bus.record(JobEvent::minimal("1", JobState::Failed));
        bus.record(JobEvent::minimal("1", JobState::Running));
        assert_eq!(bus.state("1"), Some(JobState::Failed));
        bus.shutdown().await;
        assert_eq!(
            store.get_job_record("1").map(|r| r.state).ok(),
            Some(JobState::Failed)
        );
    }

    #[tokio::test]
    async fn test_dispatch_time_is_kept() {
        let (bus, _store) = bus_with_job("1");
        let started = Utc::now();
        let mut running = JobInfo::new("1", JobState::Running);
        running.dispatch_time = Some(started);
        bus.record(JobEvent::new("1", JobState::Running, running));

        let mut done = JobInfo::new("1", JobState::Done);
        done.dispatch_time = Some(Utc::now() + chrono::Duration::seconds(5));
        done.exit_status = Some(0);
        bus.record(JobEvent::new("1", JobState::Done, done));

        let info = bus.info("1").expect("info");
        assert_eq!(info.dispatch_time, Some(started));
        assert_eq!(info.state, JobState::Done);
        assert_eq!(info.exit_status, Some(0));
    }

    #[tokio::test]
    async fn test_register_outcomes() {
        let (bus, _store) = bus_with_job("1");
        assert!(matches!(
            bus.register("1", &[JobState::Queued]),
            Ok(Registration::Ready(JobState::Queued))
        ));
        assert!(matches!(
            bus.register("1", JobState::TERMINATED),
            Ok(Registration::Pending(_))
        ));
        assert!(matches!(
            bus.register("2", JobState::TERMINATED),
            Err(JobError::NotFound(_))
        ));
        bus.record(JobEvent::minimal("1", JobState::Done));
        assert!(matches!(
            bus.register("1", &[JobState::Running]),
            Err(JobError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_wakes_on_published_event() {
        let (bus, _store) = bus_with_job("1");
        let sender = bus.sender();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            sender.publish(JobEvent::minimal("1", JobState::Running));
            sender.publish(JobEvent::minimal("1", JobState::Done));
        });
        let state = bus
            .wait("1", Duration::from_secs(5), JobState::TERMINATED)
            .await
            .expect("wait");
        assert_eq!(state, JobState::Done);
        bus.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_for_unreachable_state_fails_on_termination() {
        let (bus, _store) = bus_with_job("1");
        let sender = bus.sender();
        tokio::spawn(async move {
            sender.publish(JobEvent::minimal("1", JobState::Failed));
        });
        let result = bus
            .wait("1", Duration::from_secs(5), &[JobState::Suspended])
            .await;
        assert!(matches!(result, Err(JobError::InvalidState(_))));
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let (bus, _store) = bus_with_job("1");
        let result = bus
            .wait("1", Duration::from_millis(30), JobState::TERMINATED)
            .await;
        assert!(matches!(result, Err(JobError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_unregister_purges_cache() {
        let (bus, _store) = bus_with_job("1");
        bus.unregister("1");
        assert_eq!(bus.state("1"), None);
        assert!(bus.info("1").is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_queued_events() {
        let (bus, store) = bus_with_job("1");
        bus.publish(JobEvent::minimal("1", JobState::Done));
        bus.shutdown().await;
        bus.shutdown().await;
        assert_eq!(bus.state("1"), Some(JobState::Done));
        assert_eq!(
            store.get_job_record("1").map(|r| r.state).ok(),
            Some(JobState::Done)
        );
    }

    #[tokio::test]
    async fn test_events_after_shutdown() {
        let (bus, store) = bus_with_job("1");
        bus.record(JobEvent::minimal("1", JobState::Running));
        bus.shutdown().await;

        let returned = bus
            .sender()
            .try_publish(JobEvent::minimal("1", JobState::Done))
            .expect_err("worker stopped");
        assert_eq!(returned.state, JobState::Done);

        bus.record(JobEvent::minimal("1", JobState::Failed));
        assert_eq!(bus.state("1"), Some(JobState::Failed));
        assert_eq!(
            store.get_job_record("1").map(|r| r.state).ok(),
            Some(JobState::Running)
        );
    }
}
