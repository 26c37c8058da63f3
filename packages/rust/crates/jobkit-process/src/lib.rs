//! jobkit-process - reference scheduler running jobs as local OS processes
//!
//! # Architecture
//!
//! ```text
//! ProcessTracker ── add_job / add_array_job ──► supervisor::start_process
//!       │                                              │ Running / Done / Failed
//!       │                                              ▼
//!       ├── EventBus (waiters, state cache) ◄── unbounded channel
//!       │        │ journal
//!       └── JobStore (MemoryJobStore | PersistentJobStore)
//! ```
//!
//! Constructing a tracker over an existing persistent store re-attaches to
//! processes that survived the previous tracker.

mod allocator;
mod config;
pub mod events;
pub mod store;
pub mod supervisor;
mod tracker;

pub use allocator::{ProcessTrackerAllocator, ProcessTrackerParams, register, register_with};
pub use config::{DEFAULT_RECOVERY_POLL_INTERVAL, ProcessTrackerConfig};
pub use events::{EventBus, EventSender, JobEvent, Registration};
pub use store::{InternalJob, JobStore, MemoryJobStore, PersistentJobStore};
pub use tracker::{ProcessTracker, next_job_id};
