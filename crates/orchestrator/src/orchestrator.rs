//! The [`Orchestrator`]: owner of all process-wide state.

use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use kiln_core::job::GenerationResult;
use kiln_core::lifecycle::ExecutionMode;
use kiln_core::request::GenerationRequest;
use kiln_core::worker::{PortRange, WorkerConfig};
use kiln_events::{CompletionNotifier, EventBus, OrchestratorEvent, WaitError};
use kiln_exec::invocation::resolve_program;
use kiln_exec::OneShotExecutor;
use kiln_process::{health, ProcessRegistry, ProcessSnapshot, ProcessStats};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::OrchestratorConfig;
use crate::dispatcher::Dispatcher;
use crate::error::OrchestratorError;
use crate::forward::ServerWorkerClient;
use crate::job_store::JobStore;

/// Reason given to waiters released by [`Orchestrator::shutdown`].
const SHUTDOWN_REASON: &str = "orchestrator shutting down";

/// Owns the process registry, completion notifier, event bus and health
/// sweep for the lifetime of the process.
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) event_bus: Arc<EventBus>,
    pub(crate) registry: Arc<ProcessRegistry>,
    pub(crate) notifier: Arc<CompletionNotifier>,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) store: Arc<dyn JobStore>,
    pub(crate) job_transitions: tokio::sync::Mutex<()>,
    health_cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Build all state and start the health sweep (first sweep runs
    /// immediately).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: OrchestratorConfig, store: Arc<dyn JobStore>) -> Arc<Self> {
        let event_bus = Arc::new(EventBus::default());
        let registry = ProcessRegistry::start(config.registry_config(), Arc::clone(&event_bus));
        let executor = OneShotExecutor::new(
            config.project_root.clone(),
            config.output_dir.clone(),
            config.oneshot_timeout,
        );
        let dispatcher = Dispatcher::new(
            Arc::clone(&registry),
            executor,
            ServerWorkerClient::new(config.oneshot_timeout),
        );

        let health_cancel = CancellationToken::new();
        let health_task = tokio::spawn(health::run(
            Arc::clone(&registry),
            config.health_interval,
            health_cancel.clone(),
        ));

        tracing::info!(
            port_start = config.port_range.start,
            port_end = config.port_range.end,
            project_root = %config.project_root.display(),
            "Orchestrator started",
        );

        Arc::new(Self {
            config,
            event_bus,
            registry,
            notifier: Arc::new(CompletionNotifier::new()),
            dispatcher,
            store,
            job_transitions: tokio::sync::Mutex::new(()),
            health_cancel,
            health_task: Mutex::new(Some(health_task)),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Subscribe to process and job lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_bus.subscribe()
    }

    // ---- process registry ----

    pub fn register_process(
        &self,
        worker_id: &str,
        child: Child,
        port: Option<u16>,
        mode: ExecutionMode,
    ) -> Result<ProcessSnapshot, OrchestratorError> {
        Ok(self.registry.register(worker_id, child, port, mode)?)
    }

    pub fn kill_process(&self, worker_id: &str) -> bool {
        self.registry.kill(worker_id)
    }

    pub fn get_process(&self, worker_id: &str) -> Option<ProcessSnapshot> {
        self.registry.get(worker_id)
    }

    pub fn get_all_processes(&self) -> Vec<ProcessSnapshot> {
        self.registry.list_all()
    }

    pub fn cleanup_zombies(&self) -> usize {
        self.registry.sweep()
    }

    pub async fn get_available_port(&self, range: Option<PortRange>) -> Result<u16, OrchestratorError> {
        Ok(self.registry.get_available_port(range).await?)
    }

    pub fn send_heartbeat(&self, worker_id: &str) -> bool {
        self.registry.send_heartbeat(worker_id)
    }

    pub fn get_process_stats(&self) -> ProcessStats {
        self.registry.stats()
    }

    /// Spawn a server-mode worker on its fixed port or a freshly allocated
    /// one, and register it.
    pub async fn start_server_worker(
        &self,
        worker: &WorkerConfig,
    ) -> Result<ProcessSnapshot, OrchestratorError> {
        worker.validate()?;
        if worker.execution_mode != ExecutionMode::Server {
            return Err(OrchestratorError::InvalidConfig(format!(
                "worker {} is not a server-mode worker",
                worker.id
            )));
        }

        let port = match worker.port {
            Some(port) => port,
            None => self.registry.get_available_port(worker.port_range).await?,
        };
        let program = resolve_program(&worker.command, &self.config.project_root);
        let args = worker.server_args(port);

        tracing::info!(
            worker_id = %worker.id,
            program = %program.display(),
            arg_count = args.len(),
            port,
            "Starting server worker",
        );

        let child = Command::new(&program)
            .args(&args)
            .current_dir(&self.config.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| OrchestratorError::Spawn {
                worker_id: worker.id.clone(),
                source,
            })?;

        Ok(self
            .registry
            .register(&worker.id, child, Some(port), ExecutionMode::Server)?)
    }

    pub fn stop_worker(&self, worker_id: &str) -> bool {
        self.registry.kill(worker_id)
    }

    // ---- one-shot execution ----

    pub async fn generate_via_one_shot(
        &self,
        worker: &WorkerConfig,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, OrchestratorError> {
        Ok(self.dispatcher.executor().generate(worker, request).await?)
    }

    /// Diagnostic check that the worker's binary runs at all.
    pub async fn is_worker_available(&self, worker: &WorkerConfig) -> bool {
        self.dispatcher.executor().is_available(worker).await
    }

    /// Produce an artifact on `worker` according to its execution mode.
    pub async fn dispatch(
        &self,
        worker: &WorkerConfig,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, OrchestratorError> {
        self.dispatcher.dispatch(worker, request).await
    }

    // ---- completion notification ----

    pub async fn wait_for_job(
        &self,
        job_id: &str,
        timeout: Duration,
    ) -> Result<GenerationResult, WaitError> {
        self.notifier.await_completion(job_id, timeout).await
    }

    pub fn notify_completed(&self, job_id: &str, result: GenerationResult) -> bool {
        self.notifier.signal_completed(job_id, result)
    }

    pub fn notify_failed(&self, job_id: &str, reason: impl Into<String>) -> bool {
        self.notifier.signal_failed(job_id, reason)
    }

    pub fn notify_cancelled(&self, job_id: &str) -> bool {
        self.notifier.signal_cancelled(job_id)
    }

    /// Number of job ids with callers waiting.
    pub fn pending_waiters(&self) -> usize {
        self.notifier.pending_count()
    }

    // ---- shutdown ----

    /// Stop the health sweep, force-kill every tracked process, then
    /// reject every pending waiter. Safe to call more than once.
    pub async fn shutdown(&self) {
        tracing::info!("Orchestrator shutting down");

        self.health_cancel.cancel();
        let task = self
            .health_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Health monitor task ended abnormally");
            }
        }

        let killed = self.registry.shutdown();
        let released = self.notifier.cancel_all(SHUTDOWN_REASON);

        tracing::info!(killed, released, "Orchestrator shutdown complete");
    }
}
