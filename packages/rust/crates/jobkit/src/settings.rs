//! Runtime settings loader for jobkit.
//!
//! Loads and merges:
//! - System defaults: `/etc/jobkit/settings.yaml`
//! - User overrides:  `<JOBKIT_CONFIG_HOME>/jobkit/settings.yaml`
//!   (`$HOME/.config` when unset)
//!
//! Merge precedence is user over system, field by field.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use jobkit_core::SessionType;
use jobkit_process::{DEFAULT_RECOVERY_POLL_INTERVAL, ProcessTrackerConfig};
use serde::Deserialize;

const DEFAULT_SYSTEM_SETTINGS_PATH: &str = "/etc/jobkit/settings.yaml";
const DEFAULT_USER_SETTINGS_RELATIVE_PATH: &str = "jobkit/settings.yaml";
const DEFAULT_CONFIG_HOME_RELATIVE_PATH: &str = ".config";
const DEFAULT_DATA_HOME_RELATIVE_PATH: &str = ".local/share";
const DEFAULT_METADATA_RELATIVE_PATH: &str = "jobkit/sessions.redb";
static CONFIG_HOME_OVERRIDE: OnceLock<PathBuf> = OnceLock::new();

/// Merged settings file contents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    /// Session manager settings.
    #[serde(default)]
    pub session: SessionSettings,
    /// Process backend settings.
    #[serde(default)]
    pub process: ProcessSettings,
}

/// `session:` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionSettings {
    /// Session metadata database.
    pub metadata_path: Option<String>,
    /// Backend used when the caller does not choose one.
    pub default_session_type: Option<String>,
}

/// `process:` section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProcessSettings {
    /// Directory for per-session persistent job stores; unset keeps jobs in memory.
    pub store_dir: Option<String>,
    /// Poll interval for processes recovered after a restart.
    pub recovery_poll_interval_ms: Option<u64>,
}

impl Settings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            session: self.session.merge(overlay.session),
            process: self.process.merge(overlay.process),
        }
    }

    /// Session metadata database path.
    #[must_use]
    pub fn metadata_path(&self) -> PathBuf {
        non_empty(self.session.metadata_path.as_deref())
            .map_or_else(default_metadata_path, PathBuf::from)
    }

    /// Default session type; unparsable values fall back to the process backend.
    #[must_use]
    pub fn default_session_type(&self) -> SessionType {
        let Some(raw) = non_empty(self.session.default_session_type.as_deref()) else {
            return SessionType::default();
        };
        raw.parse().unwrap_or_else(|error| {
            tracing::warn!(value = raw, %error, "invalid default_session_type; using default");
            SessionType::default()
        })
    }

    /// Configuration for the process backend.
    #[must_use]
    pub fn process_config(&self) -> ProcessTrackerConfig {
        ProcessTrackerConfig {
            db_path: None,
            store_dir: non_empty(self.process.store_dir.as_deref()).map(PathBuf::from),
            recovery_poll_interval: self
                .process
                .recovery_poll_interval_ms
                .filter(|ms| *ms > 0)
                .map_or(DEFAULT_RECOVERY_POLL_INTERVAL, Duration::from_millis),
        }
    }
}

impl SessionSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            metadata_path: overlay.metadata_path.or(self.metadata_path),
            default_session_type: overlay.default_session_type.or(self.default_session_type),
        }
    }
}

impl ProcessSettings {
    fn merge(self, overlay: Self) -> Self {
        Self {
            store_dir: overlay.store_dir.or(self.store_dir),
            recovery_poll_interval_ms: overlay
                .recovery_poll_interval_ms
                .or(self.recovery_poll_interval_ms),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Load system and user settings, user winning.
#[must_use]
pub fn load_settings() -> Settings {
    let (system_path, user_path) = settings_paths();
    load_settings_from_paths(&system_path, &user_path)
}

/// System and user settings file locations.
#[must_use]
pub fn settings_paths() -> (PathBuf, PathBuf) {
    let system_path = PathBuf::from(DEFAULT_SYSTEM_SETTINGS_PATH);
    let user_path = resolve_config_home().join(DEFAULT_USER_SETTINGS_RELATIVE_PATH);
    (system_path, user_path)
}

/// Load and merge two explicit settings files; missing files count as empty.
#[must_use]
pub fn load_settings_from_paths(system: &Path, user: &Path) -> Settings {
    load_one(system).merge(load_one(user))
}

fn load_one(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to read settings file; ignoring"
            );
            return Settings::default();
        }
    };
    match serde_yaml::from_str::<Settings>(&raw) {
        Ok(value) => value,
        Err(error) => {
            tracing::warn!(
                path = %path.display(),
                error = %error,
                "failed to parse settings yaml; ignoring file"
            );
            Settings::default()
        }
    }
}

/// Set config-home override (takes precedence over `JOBKIT_CONFIG_HOME`).
pub fn set_config_home_override(path: impl Into<PathBuf>) {
    let path = path.into();
    if path.as_os_str().is_empty() {
        return;
    }
    if CONFIG_HOME_OVERRIDE.set(path.clone()).is_err()
        && let Some(current) = CONFIG_HOME_OVERRIDE.get()
        && current != &path
    {
        tracing::warn!(
            current = %current.display(),
            ignored = %path.display(),
            "config home override already set; ignoring subsequent value"
        );
    }
}

fn env_path(name: &str) -> Option<PathBuf> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
}

fn home_dir() -> PathBuf {
    env_path("HOME").unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
}

fn resolve_config_home() -> PathBuf {
    if let Some(path) = CONFIG_HOME_OVERRIDE.get() {
        return path.clone();
    }
    env_path("JOBKIT_CONFIG_HOME")
        .unwrap_or_else(|| home_dir().join(DEFAULT_CONFIG_HOME_RELATIVE_PATH))
}

fn default_metadata_path() -> PathBuf {
    env_path("XDG_DATA_HOME")
        .unwrap_or_else(|| home_dir().join(DEFAULT_DATA_HOME_RELATIVE_PATH))
        .join(DEFAULT_METADATA_RELATIVE_PATH)
}
