//! Worker process lifecycle: execution modes, states, and the transition
//! function that every state change in the registry goes through.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Execution mode
// ---------------------------------------------------------------------------

/// How a worker is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Long-lived process listening on a port.
    Server,
    /// One process per job, invoked from the command line.
    Cli,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Cli => "cli",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "server" => Ok(Self::Server),
            "cli" => Ok(Self::Cli),
            other => Err(CoreError::Validation(format!(
                "Invalid execution mode '{other}'. Must be one of: server, cli"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Process state
// ---------------------------------------------------------------------------

/// Lifecycle state of a tracked worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    Zombie,
}

impl ProcessState {
    /// All states, in lifecycle order.
    pub const ALL: [ProcessState; 6] = [
        Self::Starting,
        Self::Running,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
        Self::Zombie,
    ];

    /// Non-terminal states hold their port reservation.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Stopping)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
            Self::Zombie => "zombie",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Something observed about a worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// A line appeared on stdout.
    Stdout,
    /// A line appeared on stderr.
    Stderr,
    /// A caller reported the worker alive.
    Heartbeat,
    /// A stop was requested.
    KillRequested,
    /// The OS process exited.
    Exited,
    /// Waiting on the OS process failed.
    Errored,
    /// The health monitor found the process gone or silent.
    Reclassified,
}

impl LifecycleEvent {
    /// Whether this event counts as a sign of life.
    pub fn refreshes_heartbeat(self) -> bool {
        matches!(self, Self::Stdout | Self::Stderr | Self::Heartbeat)
    }
}

/// Compute the state that follows `prior` once `event` is observed.
///
/// Stderr refreshes the heartbeat but never promotes `Starting` on its
/// own, since many workers print diagnostics there before they are ready.
/// Terminal states only leave via [`LifecycleEvent::Reclassified`].
pub fn next_state(prior: ProcessState, event: LifecycleEvent) -> ProcessState {
    use LifecycleEvent as E;
    use ProcessState as S;

    match (prior, event) {
        (_, E::Reclassified) => S::Zombie,
        (s, _) if s.is_terminal() => s,
        (S::Starting, E::Stdout | E::Heartbeat) => S::Running,
        (s, E::Stdout | E::Stderr | E::Heartbeat) => s,
        (_, E::KillRequested) => S::Stopping,
        (_, E::Exited) => S::Stopped,
        (_, E::Errored) => S::Error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
