//! Routes a request to a worker according to its execution mode.
//!
//! Server-mode workers must already be registered and `running`; the
//! request is forwarded over HTTP. CLI-mode workers get a one-shot
//! invocation.

use std::sync::Arc;

use kiln_core::lifecycle::{ExecutionMode, ProcessState};
use kiln_core::request::GenerationRequest;
use kiln_core::worker::WorkerConfig;
use kiln_exec::OneShotExecutor;
use kiln_process::ProcessRegistry;

use crate::error::OrchestratorError;
use crate::forward::ServerWorkerClient;

pub struct Dispatcher {
    registry: Arc<ProcessRegistry>,
    executor: OneShotExecutor,
    client: ServerWorkerClient,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        executor: OneShotExecutor,
        client: ServerWorkerClient,
    ) -> Self {
        Self {
            registry,
            executor,
            client,
        }
    }

    pub fn executor(&self) -> &OneShotExecutor {
        &self.executor
    }

    /// Produce the artifact for `request` on `worker`.
    pub async fn dispatch(
        &self,
        worker: &WorkerConfig,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, OrchestratorError> {
        match worker.execution_mode {
            ExecutionMode::Server => self.forward(worker, request).await,
            ExecutionMode::Cli => Ok(self.executor.generate(worker, request).await?),
        }
    }

    async fn forward(
        &self,
        worker: &WorkerConfig,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, OrchestratorError> {
        let snapshot = self.registry.get(&worker.id);
        let port = match &snapshot {
            Some(s) if s.state == ProcessState::Running => s.port,
            _ => None,
        };
        let Some(port) = port else {
            return Err(OrchestratorError::WorkerNotRunning {
                worker_id: worker.id.clone(),
                state: snapshot
                    .map(|s| s.state.to_string())
                    .unwrap_or_else(|| "not registered".to_string()),
            });
        };

        let artifact = self.client.generate(port, worker.endpoint(), request).await?;
        self.registry.send_heartbeat(&worker.id);

        tracing::info!(
            worker_id = %worker.id,
            port,
            artifact_bytes = artifact.len(),
            "Server worker returned artifact",
        );
        Ok(artifact)
    }
}
