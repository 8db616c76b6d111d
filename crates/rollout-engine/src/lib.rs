//! Deployment triggering.
//!
//! [`TriggerController`] coalesces deploy requests per service so at most
//! one release runs per handle, with the newest waiting request replacing
//! any older one. Releases run through an [`Executor`]; lifecycle events are
//! written to the event log by a [`Notifier`].

pub mod error;
pub mod executor;
pub mod notify;
pub mod registry;
pub mod trigger;

pub use error::{ExecutorError, TriggerError};
pub use executor::{Completion, Executor, RancherEnv, ReleaseConfig, ReleaseExecutor};
pub use notify::Notifier;
pub use registry::ServiceRegistry;
pub use trigger::{Phase, TriggerController};
