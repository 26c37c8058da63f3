//! Registration of the process backend with a [`TrackerRegistry`].

use std::path::PathBuf;
use std::sync::Arc;

use jobkit_core::{
    Allocator, AllocatorParams, JobError, JobTracker, Result, SessionContext, SessionType,
    TrackerRegistry,
};
use tracing::debug;

use crate::config::ProcessTrackerConfig;
use crate::tracker::ProcessTracker;

/// Parameters the process backend accepts through [`AllocatorParams`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessTrackerParams {
    /// Persistent store location; overrides the configured one.
    pub db_path: Option<PathBuf>,
}

/// Builds a [`ProcessTracker`] per session.
#[derive(Debug, Clone, Default)]
pub struct ProcessTrackerAllocator {
    config: ProcessTrackerConfig,
}

impl ProcessTrackerAllocator {
    /// Allocator handing `config` to every tracker it builds.
    #[must_use]
    pub fn new(config: ProcessTrackerConfig) -> Self {
        Self { config }
    }

    fn config_for(
        &self,
        session: &SessionContext,
        params: &AllocatorParams,
    ) -> Result<ProcessTrackerConfig> {
        let mut config = self.config.clone();
        if let Some(params) = params {
            let params = params
                .downcast_ref::<ProcessTrackerParams>()
                .ok_or_else(|| {
                    JobError::InvalidArgument(
                        "process sessions expect ProcessTrackerParams".to_string(),
                    )
                })?;
            if params.db_path.is_some() {
                config.db_path.clone_from(&params.db_path);
            }
        }
        if config.db_path.is_none()
            && let Some(dir) = &config.store_dir
            && !session.name.is_empty()
        {
            config.db_path = Some(dir.join(format!("{}.redb", session.name)));
        }
        Ok(config)
    }
}

impl Allocator for ProcessTrackerAllocator {
    fn allocate(
        &self,
        session: &SessionContext,
        params: &AllocatorParams,
    ) -> Result<Arc<dyn JobTracker>> {
        let config = self.config_for(session, params)?;
        debug!(
            session = %session.name,
            db_path = ?config.db_path,
            "Allocating process tracker"
        );
        Ok(Arc::new(ProcessTracker::with_config(config)?))
    }
}

/// Register the process backend (in-memory unless params say otherwise).
pub fn register(registry: &mut TrackerRegistry) {
    register_with(registry, ProcessTrackerConfig::default());
}

/// Register the process backend with a base configuration.
pub fn register_with(registry: &mut TrackerRegistry, config: ProcessTrackerConfig) {
    registry.register(
        SessionType::Process,
        Arc::new(ProcessTrackerAllocator::new(config)),
    );
}
