//! Process registry: the single source of truth for tracked worker
//! processes.
//!
//! The registry owns one [`ProcessRecord`] per worker id. Registration
//! spawns a watcher task per child (see [`crate::watcher`]); watchers report
//! output, exit and failure over a channel to a single update loop, which
//! applies [`next_state`] to the record. Port reservations are derived from
//! the records: a port is reserved while its record is in an active state.
//!
//! Created once at startup via [`ProcessRegistry::start`]. The returned
//! `Arc` can be cheaply cloned into collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use kiln_core::lifecycle::{next_state, ExecutionMode, LifecycleEvent, ProcessState};
use kiln_core::types::{Timestamp, WorkerId};
use kiln_core::worker::{validate_worker_id, PortRange};
use kiln_events::{EventBus, OrchestratorEvent};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::health::{self, Liveness};
use crate::port::{PortAllocator, PortError, DEFAULT_PROBE_TIMEOUT};
use crate::signal;
use crate::watcher::{OutputStream, StopSignal, WatchEvent, WatchEventKind, Watcher};

/// Capacity of the watcher -> update loop channel.
const WATCH_CHANNEL_CAPACITY: usize = 1024;

/// Default grace between SIGTERM and SIGKILL on `kill`.
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Tunables for the registry and its port allocator.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub port_range: PortRange,
    pub probe_timeout: Duration,
    pub heartbeat_timeout: Duration,
    pub kill_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            port_range: PortRange {
                start: 8100,
                end: 8199,
            },
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            heartbeat_timeout: health::DEFAULT_HEARTBEAT_TIMEOUT,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }
}

/// One tracked worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessRecord {
    pub worker_id: WorkerId,
    pub pid: u32,
    /// `None` for one-shot processes.
    pub port: Option<u16>,
    pub mode: ExecutionMode,
    pub state: ProcessState,
    pub started_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
}

impl ProcessRecord {
    /// Apply a lifecycle event, refreshing the heartbeat where it counts.
    fn apply(&mut self, event: LifecycleEvent, now: Timestamp) {
        if event.refreshes_heartbeat() && self.state.is_active() {
            self.last_heartbeat_at = now;
        }
        self.state = next_state(self.state, event);
    }

    fn reserved_port(&self) -> Option<u16> {
        self.port.filter(|_| self.state.is_active())
    }

    fn snapshot(&self, now: Timestamp) -> ProcessSnapshot {
        ProcessSnapshot {
            worker_id: self.worker_id.clone(),
            pid: self.pid,
            port: self.port,
            mode: self.mode,
            state: self.state,
            started_at: self.started_at,
            last_heartbeat_at: self.last_heartbeat_at,
            last_error: self.last_error.clone(),
            exit_code: self.exit_code,
            uptime_secs: (now - self.started_at).num_seconds().max(0),
        }
    }
}

/// Point-in-time copy of a [`ProcessRecord`] handed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub worker_id: WorkerId,
    pub pid: u32,
    pub port: Option<u16>,
    pub mode: ExecutionMode,
    pub state: ProcessState,
    pub started_at: Timestamp,
    pub last_heartbeat_at: Timestamp,
    pub last_error: Option<String>,
    pub exit_code: Option<i32>,
    pub uptime_secs: i64,
}

/// Aggregate view of the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProcessStats {
    pub total: usize,
    pub by_state: HashMap<ProcessState, usize>,
    pub by_mode: HashMap<ExecutionMode, usize>,
    /// Sorted.
    pub reserved_ports: Vec<u16>,
    /// Zombies removed by the sweep that preceded these numbers.
    pub zombies_reclaimed: usize,
}

/// Errors returned by the registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A registration argument is missing or malformed.
    #[error("Invalid registration: {0}")]
    InvalidArgument(String),

    /// Another active worker already holds the port.
    #[error("Port {port} is reserved by worker {holder}")]
    PortReserved { port: u16, holder: WorkerId },

    #[error(transparent)]
    Port(#[from] PortError),
}

struct TrackedProcess {
    record: ProcessRecord,
    instance: u64,
    /// Taken when a stop is requested; dropping it detaches silently.
    stop_tx: Option<oneshot::Sender<StopSignal>>,
}

impl TrackedProcess {
    fn stop(&mut self, signal: StopSignal) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(signal);
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

pub struct ProcessRegistry {
    processes: Arc<Mutex<HashMap<WorkerId, TrackedProcess>>>,
    watch_tx: mpsc::Sender<WatchEvent>,
    allocator: PortAllocator,
    config: RegistryConfig,
    event_bus: Arc<EventBus>,
    next_instance: AtomicU64,
    cancel: CancellationToken,
}

impl ProcessRegistry {
    /// Create the registry and spawn its update loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: RegistryConfig, event_bus: Arc<EventBus>) -> Arc<Self> {
        let (watch_tx, watch_rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let processes = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();

        tokio::spawn(run_update_loop(
            Arc::clone(&processes),
            watch_rx,
            Arc::clone(&event_bus),
            cancel.clone(),
        ));

        Arc::new(Self {
            processes,
            watch_tx,
            allocator: PortAllocator::new(config.port_range, config.probe_timeout),
            config,
            event_bus,
            next_instance: AtomicU64::new(1),
            cancel,
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Start tracking `child` for `worker_id`.
    ///
    /// An active process already registered for `worker_id` is killed
    /// first. Server-mode registrations require a port, and the port must
    /// not be held by another active worker.
    pub fn register(
        &self,
        worker_id: &str,
        child: Child,
        port: Option<u16>,
        mode: ExecutionMode,
    ) -> Result<ProcessSnapshot, RegistryError> {
        validate_worker_id(worker_id).map_err(|e| RegistryError::InvalidArgument(e.to_string()))?;
        let pid = child.id().ok_or_else(|| {
            RegistryError::InvalidArgument(format!(
                "process for worker {worker_id} has already exited"
            ))
        })?;
        match (mode, port) {
            (_, Some(0)) => {
                return Err(RegistryError::InvalidArgument("port 0 is not allowed".into()));
            }
            (ExecutionMode::Server, None) => {
                return Err(RegistryError::InvalidArgument(format!(
                    "server-mode worker {worker_id} requires a port"
                )));
            }
            _ => {}
        }

        let now = Utc::now();
        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        let (stop_tx, stop_rx) = oneshot::channel();

        let snapshot = {
            let mut processes = self.lock();

            if let Some(port) = port {
                if let Some(holder) = processes.values().find(|p| {
                    p.record.worker_id != worker_id && p.record.reserved_port() == Some(port)
                }) {
                    return Err(RegistryError::PortReserved {
                        port,
                        holder: holder.record.worker_id.clone(),
                    });
                }
            }

            if let Some(mut previous) = processes.remove(worker_id) {
                if previous.record.state.is_active() {
                    tracing::warn!(
                        worker_id,
                        previous_pid = previous.record.pid,
                        previous_port = previous.record.port,
                        "Worker already registered, killing previous process",
                    );
                    previous.stop(StopSignal::Force);
                }
            }

            let record = ProcessRecord {
                worker_id: worker_id.to_string(),
                pid,
                port,
                mode,
                state: ProcessState::Starting,
                started_at: now,
                last_heartbeat_at: now,
                last_error: None,
                exit_code: None,
            };
            let snapshot = record.snapshot(now);
            processes.insert(
                worker_id.to_string(),
                TrackedProcess {
                    record,
                    instance,
                    stop_tx: Some(stop_tx),
                },
            );
            snapshot
        };

        let watcher = Watcher {
            worker_id: worker_id.to_string(),
            instance,
            pid,
            mode,
            events: self.watch_tx.clone(),
        };
        tokio::spawn(watcher.run(child, stop_rx));

        tracing::info!(worker_id, pid, port, mode = %mode, "Process registered");
        self.event_bus.publish(OrchestratorEvent::ProcessRegistered {
            worker_id: worker_id.to_string(),
            pid,
            port,
            mode,
        });

        Ok(snapshot)
    }

    /// Snapshot of one worker, with liveness re-evaluated first.
    pub fn get(&self, worker_id: &str) -> Option<ProcessSnapshot> {
        let now = Utc::now();
        let mut processes = self.lock();
        let tracked = processes.get_mut(worker_id)?;
        self.reevaluate(&mut tracked.record);
        Some(tracked.record.snapshot(now))
    }

    /// Snapshots of every tracked worker, sorted by worker id.
    pub fn list_all(&self) -> Vec<ProcessSnapshot> {
        let now = Utc::now();
        let mut processes = self.lock();
        let mut all: Vec<ProcessSnapshot> = processes
            .values_mut()
            .map(|tracked| {
                self.reevaluate(&mut tracked.record);
                tracked.record.snapshot(now)
            })
            .collect();
        all.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        all
    }

    /// Stop a worker: SIGTERM now, SIGKILL after the grace period.
    ///
    /// The record is removed and its port released immediately. Returns
    /// `false` if the worker is unknown.
    pub fn kill(&self, worker_id: &str) -> bool {
        let Some(mut tracked) = self.lock().remove(worker_id) else {
            return false;
        };

        tracked.record.apply(LifecycleEvent::KillRequested, Utc::now());
        tracked.stop(StopSignal::Graceful(self.config.kill_grace));

        tracing::info!(
            worker_id,
            pid = tracked.record.pid,
            port = tracked.record.port,
            grace_secs = self.config.kill_grace.as_secs(),
            "Process kill requested",
        );
        self.event_bus.publish(OrchestratorEvent::ProcessKilled {
            worker_id: worker_id.to_string(),
            pid: tracked.record.pid,
        });
        true
    }

    /// Drop bookkeeping for a worker without signalling its process.
    pub fn unregister(&self, worker_id: &str) -> bool {
        let removed = self.lock().remove(worker_id);
        if let Some(tracked) = &removed {
            tracing::info!(worker_id, pid = tracked.record.pid, "Process unregistered");
        }
        removed.is_some()
    }

    /// Record a sign of life from `worker_id`.
    pub fn send_heartbeat(&self, worker_id: &str) -> bool {
        match self.lock().get_mut(worker_id) {
            Some(tracked) => {
                tracked.record.apply(LifecycleEvent::Heartbeat, Utc::now());
                true
            }
            None => false,
        }
    }

    /// Ports currently held by active records.
    pub fn reserved_ports(&self) -> HashSet<u16> {
        self.lock()
            .values()
            .filter_map(|p| p.record.reserved_port())
            .collect()
    }

    /// Find a free port, in `range` or the configured default range.
    pub async fn get_available_port(&self, range: Option<PortRange>) -> Result<u16, PortError> {
        let reserved = self.reserved_ports();
        let range = range.unwrap_or(self.config.port_range);
        self.allocator.find_available_port_in(range, &reserved).await
    }

    /// Remove every zombie and release its port. Returns how many were
    /// reclaimed.
    ///
    /// A zombie whose process still exists (a silent one) is force-killed
    /// so its port is actually freed.
    pub fn sweep(&self) -> usize {
        let zombies: Vec<(TrackedProcess, health::ZombieReason)> = {
            let mut processes = self.lock();
            let ids: Vec<(WorkerId, health::ZombieReason)> = processes
                .values()
                .filter_map(|p| {
                    match health::check_liveness(&p.record, self.config.heartbeat_timeout) {
                        Liveness::Zombie(reason) => Some((p.record.worker_id.clone(), reason)),
                        Liveness::Alive => None,
                    }
                })
                .collect();
            ids.into_iter()
                .filter_map(|(id, reason)| processes.remove(&id).map(|p| (p, reason)))
                .collect()
        };

        let reclaimed = zombies.len();
        for (mut tracked, reason) in zombies {
            if signal::process_exists(tracked.record.pid) {
                tracked.stop(StopSignal::Force);
            }
            tracing::warn!(
                worker_id = %tracked.record.worker_id,
                pid = tracked.record.pid,
                port = tracked.record.port,
                reason = %reason,
                "Reclaimed zombie process",
            );
            self.event_bus.publish(OrchestratorEvent::ZombieReclaimed {
                worker_id: tracked.record.worker_id.clone(),
                pid: tracked.record.pid,
                reason: reason.to_string(),
            });
        }

        reclaimed
    }

    /// Sweep, then summarise what remains.
    pub fn stats(&self) -> ProcessStats {
        let zombies_reclaimed = self.sweep();
        let processes = self.lock();

        let mut stats = ProcessStats {
            total: processes.len(),
            zombies_reclaimed,
            ..Default::default()
        };
        for tracked in processes.values() {
            *stats.by_state.entry(tracked.record.state).or_default() += 1;
            *stats.by_mode.entry(tracked.record.mode).or_default() += 1;
            if let Some(port) = tracked.record.reserved_port() {
                stats.reserved_ports.push(port);
            }
        }
        stats.reserved_ports.sort_unstable();
        stats
    }

    /// Force-kill every tracked process and stop the update loop.
    ///
    /// Returns the number of processes signalled.
    pub fn shutdown(&self) -> usize {
        let drained: Vec<TrackedProcess> = self.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for mut tracked in drained {
            tracing::info!(
                worker_id = %tracked.record.worker_id,
                pid = tracked.record.pid,
                "Killing process for shutdown",
            );
            tracked.stop(StopSignal::Force);
        }
        self.cancel.cancel();
        count
    }

    // ---- private helpers ----

    fn lock(&self) -> MutexGuard<'_, HashMap<WorkerId, TrackedProcess>> {
        lock(&self.processes)
    }

    /// Mark an active record whose process is gone or silent as a zombie,
    /// so callers never see `running` for a dead process. Removal is left
    /// to the sweep.
    fn reevaluate(&self, record: &mut ProcessRecord) {
        if !record.state.is_active() {
            return;
        }
        if let Liveness::Zombie(reason) = health::check_liveness(record, self.config.heartbeat_timeout) {
            tracing::debug!(
                worker_id = %record.worker_id,
                reason = %reason,
                "Process reclassified as zombie",
            );
            record.apply(LifecycleEvent::Reclassified, Utc::now());
        }
    }
}

fn lock(
    processes: &Mutex<HashMap<WorkerId, TrackedProcess>>,
) -> MutexGuard<'_, HashMap<WorkerId, TrackedProcess>> {
    processes.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Update loop
// ---------------------------------------------------------------------------

/// Apply watcher events to records, in the order they arrive.
///
/// Events for a registration that has since been killed, replaced or
/// reclaimed are dropped.
async fn run_update_loop(
    processes: Arc<Mutex<HashMap<WorkerId, TrackedProcess>>>,
    mut watch_rx: mpsc::Receiver<WatchEvent>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Registry update loop stopping");
                break;
            }
            event = watch_rx.recv() => {
                let Some(event) = event else { break };
                let published = apply_watch_event(&processes, event);
                if let Some(published) = published {
                    event_bus.publish(published);
                }
            }
        }
    }
}

fn apply_watch_event(
    processes: &Mutex<HashMap<WorkerId, TrackedProcess>>,
    event: WatchEvent,
) -> Option<OrchestratorEvent> {
    let mut processes = lock(processes);
    let tracked = processes
        .get_mut(&event.worker_id)
        .filter(|p| p.instance == event.instance)?;
    let record = &mut tracked.record;
    let now = Utc::now();

    match event.kind {
        WatchEventKind::Output(stream) => {
            let lifecycle = match stream {
                OutputStream::Stdout => LifecycleEvent::Stdout,
                OutputStream::Stderr => LifecycleEvent::Stderr,
            };
            let before = record.state;
            record.apply(lifecycle, now);
            if before != record.state {
                tracing::info!(
                    worker_id = %record.worker_id,
                    pid = record.pid,
                    from = %before,
                    to = %record.state,
                    "Process state changed",
                );
            }
            None
        }
        WatchEventKind::Exited(exit_code) => {
            record.apply(LifecycleEvent::Exited, now);
            record.exit_code = exit_code;
            tracing::info!(
                worker_id = %record.worker_id,
                pid = record.pid,
                exit_code,
                "Process exited",
            );
            Some(OrchestratorEvent::ProcessExited {
                worker_id: record.worker_id.clone(),
                pid: record.pid,
                exit_code,
            })
        }
        WatchEventKind::Failed(error) => {
            tracing::error!(
                worker_id = %record.worker_id,
                pid = record.pid,
                error = %error,
                "Process wait failed",
            );
            record.apply(LifecycleEvent::Errored, now);
            record.last_error = Some(error);
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
