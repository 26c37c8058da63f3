//! jobkit-core - resource-manager-agnostic job model
//!
//! Shared vocabulary for every jobkit backend:
//! - [`JobTemplate`]: what to run
//! - [`JobInfo`] / [`JobState`]: what happened
//! - [`JobTracker`]: the contract a backend implements, with optional
//!   capabilities discovered through `as_*` queries
//! - [`TrackerRegistry`]: explicit mapping from [`SessionType`] to backend factory

mod error;
mod info;
mod registry;
mod state;
mod template;
mod tracker;

pub use error::{JobError, Result};
pub use info::{JobInfo, Machine, Queue};
pub use registry::{Allocator, AllocatorParams, SessionContext, SessionType, TrackerRegistry};
pub use state::{JobAction, JobState};
pub use template::{
    EXTENSION_CHROOT, JobTemplate, STDERR_PATH, STDIN_PATH, STDOUT_PATH,
};
pub use tracker::{ContactStringer, JobTemplater, JobTracker, Monitorer, SessionCloser};
