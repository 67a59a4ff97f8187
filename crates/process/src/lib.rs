//! Worker process bookkeeping for the kiln orchestrator.
//!
//! - [`port::PortAllocator`]: finds free TCP ports by probing the OS.
//! - [`registry::ProcessRegistry`]: the single source of truth for which
//!   worker processes are alive, on which port, and in which state.
//! - [`health`]: liveness classification, zombie sweeps, and the periodic
//!   sweep loop.
//! - [`signal`]: thin wrappers over `kill(2)`.

pub mod health;
pub mod port;
pub mod registry;
pub mod signal;
mod watcher;

pub use health::{Liveness, ZombieReason};
pub use port::{PortAllocator, PortError};
pub use registry::{ProcessRegistry, ProcessSnapshot, ProcessStats, RegistryConfig, RegistryError};
