//! One-shot command execution for workers without a server mode.
//!
//! A one-shot invocation is a single spawn-run-exit cycle: the worker's
//! base arguments plus request-derived flags are assembled into a
//! [`CommandInvocation`], the binary runs under a wall-clock timeout, and
//! the artifact it announces (or the requested output path) is read back
//! into memory and deleted.

pub mod error;
pub mod executor;
pub mod invocation;

pub use error::ExecError;
pub use executor::OneShotExecutor;
pub use invocation::CommandInvocation;
