//! In-process signalling for the kiln orchestrator.
//!
//! - [`EventBus`]: publish/subscribe hub for [`OrchestratorEvent`]s,
//!   backed by `tokio::sync::broadcast`.
//! - [`CompletionNotifier`]: lets any number of callers wait for a job's
//!   terminal outcome without polling the job store.

pub mod bus;
pub mod notifier;

pub use bus::{EventBus, OrchestratorEvent};
pub use notifier::{CompletionNotifier, WaitError};
