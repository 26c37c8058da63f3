//! jobkit - resource-manager-agnostic job sessions
//!
//! # Architecture
//!
//! ```text
//! SessionManager ── TrackerRegistry ── Allocator ──► Arc<dyn JobTracker>
//!       │                                                  ▲
//!       ├── SessionStore (redb: name → type, contact)      │
//!       ▼                                                  │
//! JobSession / MonitoringSession ── Job<'_> / JobArray<'_> ┘ (borrowed)
//! ```
//!
//! Backends are registered explicitly, e.g. `jobkit_process::register(&mut registry)`.

mod job;
mod logging;
mod manager;
mod monitoring;
mod session;
pub mod session_store;
pub mod settings;
mod wait_any;

pub use job::{Job, JobArray, matches_filter};
pub use logging::init_tracing;
pub use manager::SessionManager;
pub use monitoring::MonitoringSession;
pub use session::{JobSession, normalize_bulk_range};
pub use session_store::{SessionRecord, SessionStore};
pub use settings::{Settings, load_settings, set_config_home_override};
pub use wait_any::wait_any;

pub use jobkit_core::{
    Allocator, AllocatorParams, ContactStringer, JobAction, JobError, JobInfo, JobState,
    JobTemplate, JobTemplater, JobTracker, Machine, Monitorer, Queue, Result, SessionCloser,
    SessionContext, SessionType, TrackerRegistry,
};
