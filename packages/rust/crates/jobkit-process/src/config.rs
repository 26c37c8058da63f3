//! Process tracker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default poll interval for processes re-attached after a restart.
pub const DEFAULT_RECOVERY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How a [`ProcessTracker`](crate::ProcessTracker) keeps its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTrackerConfig {
    /// Database file of the persistent job store; `None` keeps jobs in memory.
    pub db_path: Option<PathBuf>,
    /// Directory holding one `<session>.redb` per session when the allocator
    /// is not handed an explicit `db_path`.
    pub store_dir: Option<PathBuf>,
    /// How often a recovered process is polled for exit.
    pub recovery_poll_interval: Duration,
}

impl Default for ProcessTrackerConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            store_dir: None,
            recovery_poll_interval: DEFAULT_RECOVERY_POLL_INTERVAL,
        }
    }
}

impl ProcessTrackerConfig {
    /// In-memory configuration.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Persistent configuration backed by `db_path`.
    #[must_use]
    pub fn persistent(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(db_path.into()),
            ..Self::default()
        }
    }
}
