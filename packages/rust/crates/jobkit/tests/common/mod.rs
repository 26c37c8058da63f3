//! Shared test doubles.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobkit::{
    Allocator, AllocatorParams, ContactStringer, JobAction, JobError, JobInfo, JobState,
    JobTemplate, JobTracker, Result, SessionContext,
};

/// Tracker whose job states are driven by the test.
#[derive(Default)]
pub struct MockTracker {
    states: Mutex<HashMap<String, JobState>>,
    next_id: Mutex<u64>,
    contact: String,
}

impl MockTracker {
    pub fn with_contact(contact: impl Into<String>) -> Self {
        Self {
            contact: contact.into(),
            ..Self::default()
        }
    }

    pub fn set_state(&self, job_id: &str, state: JobState) {
        self.states
            .lock()
            .expect("states")
            .insert(job_id.to_string(), state);
    }

    fn state_of(&self, job_id: &str) -> Option<JobState> {
        self.states.lock().expect("states").get(job_id).copied()
    }
}

#[async_trait]
impl JobTracker for MockTracker {
    async fn list_jobs(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.states.lock().expect("states").keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_array_jobs(&self, array_id: &str) -> Result<Vec<String>> {
        Err(JobError::unknown_job(array_id))
    }

    async fn add_job(&self, template: JobTemplate) -> Result<String> {
        template.validate()?;
        let mut next = self.next_id.lock().expect("ids");
        *next += 1;
        let job_id = next.to_string();
        self.set_state(&job_id, JobState::Queued);
        Ok(job_id)
    }

    async fn add_array_job(
        &self,
        _template: JobTemplate,
        _begin: u64,
        _end: u64,
        _step: u64,
        _max_parallel: u64,
    ) -> Result<String> {
        Err(JobError::UnsupportedOperation("array jobs".to_string()))
    }

    async fn job_state(&self, job_id: &str) -> Result<(JobState, String)> {
        Ok((self.state_of(job_id).unwrap_or_default(), String::new()))
    }

    async fn job_info(&self, job_id: &str) -> Result<JobInfo> {
        self.state_of(job_id)
            .map(|state| JobInfo::new(job_id, state))
            .ok_or_else(|| JobError::unknown_job(job_id))
    }

    async fn job_control(&self, job_id: &str, action: JobAction) -> Result<()> {
        match action {
            JobAction::Terminate => {
                self.set_state(job_id, JobState::Failed);
                Ok(())
            }
            other => Err(JobError::UnsupportedOperation(other.to_string())),
        }
    }

    async fn wait(&self, job_id: &str, timeout: Duration, states: &[JobState]) -> Result<()> {
        let poll = async {
            loop {
                let state = self
                    .state_of(job_id)
                    .ok_or_else(|| JobError::unknown_job(job_id))?;
                if states.contains(&state) {
                    return Ok(());
                }
                if state.is_terminal() {
                    return Err(JobError::InvalidState(format!("job {job_id} is {state}")));
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        if timeout.is_zero() {
            poll.await
        } else {
            tokio::time::timeout(timeout, poll)
                .await
                .map_err(|_| JobError::Timeout(job_id.to_string()))?
        }
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        self.states.lock().expect("states").remove(job_id);
        Ok(())
    }

    async fn list_job_categories(&self) -> Result<Vec<String>> {
        Ok(vec!["mock".to_string()])
    }

    fn as_contact_stringer(&self) -> Option<&dyn ContactStringer> {
        Some(self)
    }
}

impl ContactStringer for MockTracker {
    fn contact_string(&self) -> Result<String> {
        Ok(self.contact.clone())
    }
}

/// Allocator recording every context it was asked to serve.
#[derive(Default)]
pub struct MockAllocator {
    pub contexts: Mutex<Vec<SessionContext>>,
}

impl Allocator for MockAllocator {
    fn allocate(
        &self,
        session: &SessionContext,
        _params: &AllocatorParams,
    ) -> Result<Arc<dyn JobTracker>> {
        self.contexts.lock().expect("contexts").push(session.clone());
        let contact = session
            .contact
            .clone()
            .unwrap_or_else(|| format!("mock://{}", session.name));
        Ok(Arc::new(MockTracker::with_contact(contact)))
    }
}

pub fn shell(script: &str) -> JobTemplate {
    JobTemplate::new("/bin/sh", ["-c", script])
}
