//! Liveness classification and the periodic zombie sweep.
//!
//! A record is a zombie when any of these hold:
//! - it already reached a terminal state,
//! - its last heartbeat is older than the heartbeat timeout,
//! - the OS reports that its pid no longer exists.
//!
//! [`classify`] is pure so the rules can be tested without processes;
//! [`check_liveness`] feeds it a real signal-0 probe.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kiln_core::lifecycle::ProcessState;
use kiln_core::types::Timestamp;
use tokio_util::sync::CancellationToken;

use crate::registry::{ProcessRecord, ProcessRegistry};
use crate::signal;

/// Default age after which a silent process is considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval of the background sweep.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Why a record was classified as a zombie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZombieReason {
    /// The record is already `stopped`, `error` or `zombie`.
    Terminal(ProcessState),
    /// No heartbeat for longer than the timeout.
    HeartbeatStale { age_secs: i64 },
    /// The pid no longer exists.
    ProcessGone,
}

impl std::fmt::Display for ZombieReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminal(state) => write!(f, "process already {state}"),
            Self::HeartbeatStale { age_secs } => write!(f, "no heartbeat for {age_secs}s"),
            Self::ProcessGone => f.write_str("process no longer exists"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    Zombie(ZombieReason),
}

impl Liveness {
    pub fn is_zombie(self) -> bool {
        matches!(self, Self::Zombie(_))
    }
}

/// Classify a record given the current time and whether its pid exists.
pub fn classify(
    record: &ProcessRecord,
    now: Timestamp,
    heartbeat_timeout: Duration,
    process_exists: bool,
) -> Liveness {
    if record.state.is_terminal() {
        return Liveness::Zombie(ZombieReason::Terminal(record.state));
    }

    let age = now - record.last_heartbeat_at;
    let timeout = chrono::Duration::from_std(heartbeat_timeout).unwrap_or(chrono::Duration::MAX);
    if age > timeout {
        return Liveness::Zombie(ZombieReason::HeartbeatStale {
            age_secs: age.num_seconds(),
        });
    }

    if !process_exists {
        return Liveness::Zombie(ZombieReason::ProcessGone);
    }

    Liveness::Alive
}

/// Classify a record against the live OS state.
///
/// Has no side effects: two calls without intervening activity agree.
pub fn check_liveness(record: &ProcessRecord, heartbeat_timeout: Duration) -> Liveness {
    classify(
        record,
        Utc::now(),
        heartbeat_timeout,
        signal::process_exists(record.pid),
    )
}

/// Run the zombie sweep every `interval` until `cancel` is triggered.
///
/// The first sweep happens immediately.
pub async fn run(registry: Arc<ProcessRegistry>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(
        interval_secs = interval.as_secs(),
        "Health monitor started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Health monitor stopping");
                break;
            }
            _ = ticker.tick() => {
                let reclaimed = registry.sweep();
                if reclaimed > 0 {
                    tracing::info!(reclaimed, "Health sweep reclaimed zombies");
                } else {
                    tracing::debug!("Health sweep found no zombies");
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
