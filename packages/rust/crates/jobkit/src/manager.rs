//! Session manager: creates, reopens and destroys named sessions.

use std::path::Path;

use jobkit_core::{
    AllocatorParams, JobError, JobTracker, Result, SessionContext, SessionType, TrackerRegistry,
};
use tracing::{debug, info};

use crate::monitoring::MonitoringSession;
use crate::session::JobSession;
use crate::session_store::{SessionRecord, SessionStore};
use crate::settings::Settings;

/// Entry point for session lifecycle management.
#[derive(Debug)]
pub struct SessionManager {
    registry: TrackerRegistry,
    store: SessionStore,
    default_session_type: SessionType,
}

impl SessionManager {
    /// Manager over `registry`, keeping session metadata at `metadata_path`.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] when the metadata store cannot be opened.
    pub fn new(registry: TrackerRegistry, metadata_path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            registry,
            store: SessionStore::open(metadata_path)?,
            default_session_type: SessionType::default(),
        })
    }

    /// Manager configured from loaded settings.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] when the metadata store cannot be opened.
    pub fn from_settings(registry: TrackerRegistry, settings: &Settings) -> Result<Self> {
        let mut manager = Self::new(registry, settings.metadata_path())?;
        manager.default_session_type = settings.default_session_type();
        Ok(manager)
    }

    /// Registered backends.
    #[must_use]
    pub fn registry(&self) -> &TrackerRegistry {
        &self.registry
    }

    /// Backend used by [`create_default_job_session`](Self::create_default_job_session).
    #[must_use]
    pub fn default_session_type(&self) -> SessionType {
        self.default_session_type
    }

    fn allocate(
        &self,
        name: &str,
        session_type: SessionType,
        contact: Option<String>,
        params: &AllocatorParams,
    ) -> Result<std::sync::Arc<dyn JobTracker>> {
        let context = SessionContext {
            name: name.to_string(),
            contact,
        };
        self.registry.allocate(session_type, &context, params)
    }

    /// Create a new job session.
    ///
    /// # Errors
    ///
    /// - [`JobError::InvalidArgument`] when the name is taken
    /// - [`JobError::NotFound`] when no backend serves `session_type`
    pub fn create_job_session(
        &self,
        name: &str,
        session_type: SessionType,
        params: AllocatorParams,
    ) -> Result<JobSession> {
        if self.store.get(name)?.is_some() {
            return Err(JobError::InvalidArgument(format!(
                "session '{name}' already exists"
            )));
        }
        let tracker = self.allocate(name, session_type, None, &params)?;
        let contact = if session_type == SessionType::LegacyLibrary {
            tracker
                .as_contact_stringer()
                .map(|stringer| stringer.contact_string())
                .transpose()?
        } else {
            None
        };
        self.store.create(
            name,
            &SessionRecord {
                session_type,
                contact,
            },
        )?;
        info!(session = name, %session_type, "Created job session");
        Ok(JobSession::new(name, tracker))
    }

    /// Create a job session on the default backend.
    ///
    /// # Errors
    ///
    /// Same as [`create_job_session`](Self::create_job_session).
    pub fn create_default_job_session(
        &self,
        name: &str,
        params: AllocatorParams,
    ) -> Result<JobSession> {
        self.create_job_session(name, self.default_session_type, params)
    }

    /// Reopen an existing job session.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for unknown names.
    pub fn open_job_session(&self, name: &str, params: AllocatorParams) -> Result<JobSession> {
        let record = self
            .store
            .get(name)?
            .ok_or_else(|| JobError::NotFound(format!("session '{name}' does not exist")))?;
        let tracker = self.allocate(name, record.session_type, record.contact, &params)?;
        debug!(session = name, session_type = %record.session_type, "Opened job session");
        Ok(JobSession::new(name, tracker))
    }

    /// Forget a job session's metadata.
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] for unknown names.
    pub fn destroy_job_session(&self, name: &str) -> Result<()> {
        if !self.store.remove(name)? {
            return Err(JobError::NotFound(format!("session '{name}' does not exist")));
        }
        info!(session = name, "Destroyed job session");
        Ok(())
    }

    /// Names of all job sessions.
    ///
    /// # Errors
    ///
    /// [`JobError::Internal`] on storage failures.
    pub fn job_session_names(&self) -> Result<Vec<String>> {
        self.store.names()
    }

    /// Open a monitoring session; it is not recorded as a job session.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] when no backend serves `session_type`
    /// - [`JobError::UnsupportedOperation`] when the backend cannot monitor
    pub fn open_monitoring_session(
        &self,
        name: &str,
        session_type: SessionType,
        params: AllocatorParams,
    ) -> Result<MonitoringSession> {
        let tracker = self.allocate(name, session_type, None, &params)?;
        MonitoringSession::new(name, tracker)
    }
}
