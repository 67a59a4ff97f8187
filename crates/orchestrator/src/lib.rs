//! Composition root of the kiln orchestrator.
//!
//! [`Orchestrator`] owns every piece of process-wide state (process
//! registry, completion notifier, event bus, health sweep task) and exposes
//! the surface an HTTP layer consumes. It is built once at startup with
//! [`Orchestrator::start`] and torn down with [`Orchestrator::shutdown`].

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod job_store;
mod jobs;
pub mod orchestrator;

pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use job_store::{InMemoryJobStore, JobStore, StoreError};
pub use orchestrator::Orchestrator;
