//! Explicit registry of backend factories.
//!
//! Backends add themselves by calling their own `register` function on a
//! registry the application constructs; nothing is registered implicitly.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{JobError, Result};
use crate::tracker::JobTracker;

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    /// Jobs run as local OS processes.
    #[default]
    Process,
    /// Jobs run as containers.
    Container,
    /// Jobs run on a cluster job API.
    Cluster,
    /// Jobs go through a legacy C job-submission library.
    LegacyLibrary,
    /// Jobs are forwarded to a remote HTTP job service.
    Remote,
    /// Jobs run as cloud tasks.
    CloudTask,
}

impl SessionType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Container => "container",
            Self::Cluster => "cluster",
            Self::LegacyLibrary => "legacy_library",
            Self::Remote => "remote",
            Self::CloudTask => "cloud_task",
        }
    }
}

impl fmt::Display for SessionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionType {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "process" | "default" => Ok(Self::Process),
            "container" => Ok(Self::Container),
            "cluster" => Ok(Self::Cluster),
            "legacy_library" | "libdrmaa" => Ok(Self::LegacyLibrary),
            "remote" => Ok(Self::Remote),
            "cloud_task" => Ok(Self::CloudTask),
            other => Err(JobError::InvalidArgument(format!(
                "unknown session type '{other}'"
            ))),
        }
    }
}

/// Identity handed to an allocator when a session is created or reopened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    /// Session name.
    pub name: String,
    /// Contact string restored from session metadata, if any.
    pub contact: Option<String>,
}

/// Backend specific initialization value, passed through untouched.
pub type AllocatorParams = Option<Arc<dyn Any + Send + Sync>>;

/// Factory creating a tracker for one session.
pub trait Allocator: Send + Sync {
    /// Build the tracker servicing `session`.
    ///
    /// # Errors
    ///
    /// Returns an error when the backend cannot be initialized.
    fn allocate(
        &self,
        session: &SessionContext,
        params: &AllocatorParams,
    ) -> Result<Arc<dyn JobTracker>>;
}

/// Maps a session type to the allocator that serves it.
#[derive(Clone, Default)]
pub struct TrackerRegistry {
    allocators: HashMap<SessionType, Arc<dyn Allocator>>,
}

impl TrackerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the allocator for `session_type`.
    pub fn register(&mut self, session_type: SessionType, allocator: Arc<dyn Allocator>) {
        self.allocators.insert(session_type, allocator);
    }

    /// Whether a backend is registered for `session_type`.
    #[must_use]
    pub fn contains(&self, session_type: SessionType) -> bool {
        self.allocators.contains_key(&session_type)
    }

    /// Registered session types.
    #[must_use]
    pub fn session_types(&self) -> Vec<SessionType> {
        let mut types: Vec<SessionType> = self.allocators.keys().copied().collect();
        types.sort_by_key(|t| t.as_str());
        types
    }

    /// Create a tracker through the registered allocator.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::NotFound`] when no backend is registered for
    /// `session_type`, or the allocator's own error.
    pub fn allocate(
        &self,
        session_type: SessionType,
        session: &SessionContext,
        params: &AllocatorParams,
    ) -> Result<Arc<dyn JobTracker>> {
        let allocator = self.allocators.get(&session_type).ok_or_else(|| {
            JobError::NotFound(format!("no tracker registered for '{session_type}'"))
        })?;
        allocator.allocate(session, params)
    }
}

impl fmt::Debug for TrackerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackerRegistry")
            .field("session_types", &self.session_types())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_type_round_trips_through_display() {
        for ty in [
            SessionType::Process,
            SessionType::Container,
            SessionType::Cluster,
            SessionType::LegacyLibrary,
            SessionType::Remote,
            SessionType::CloudTask,
        ] {
            assert_eq!(ty.to_string().parse::<SessionType>().ok(), Some(ty));
        }
        assert_eq!(
            "legacy-library".parse::<SessionType>().ok(),
            Some(SessionType::LegacyLibrary)
        );
    }

    #[test]
    fn test_unknown_backend_is_not_found() {
        let registry = TrackerRegistry::new();
        let result = registry.allocate(
            SessionType::Cluster,
            &SessionContext::default(),
            &None,
        );
        assert!(matches!(result, Err(JobError::NotFound(_))));
        assert!(!registry.contains(SessionType::Cluster));
    }
}
