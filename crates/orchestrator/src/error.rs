use kiln_core::error::CoreError;
use kiln_core::job::JobStatus;
use kiln_core::types::{JobId, WorkerId};
use kiln_events::WaitError;
use kiln_exec::ExecError;
use kiln_process::{PortError, RegistryError};

use crate::forward::ForwardError;
use crate::job_store::StoreError;

/// Errors surfaced by the orchestrator's public operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Worker configuration is missing or malformed.
    #[error("Invalid worker configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Failed to spawn worker {worker_id}: {source}")]
    Spawn {
        worker_id: WorkerId,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Exec(#[from] ExecError),

    /// A server-mode worker is not registered or not yet running.
    #[error("Worker {worker_id} is not running ({state})")]
    WorkerNotRunning { worker_id: WorkerId, state: String },

    #[error(transparent)]
    Forward(#[from] ForwardError),

    #[error(transparent)]
    Wait(#[from] WaitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The job reached a terminal status elsewhere (e.g. it was cancelled)
    /// before this run could record its own outcome.
    #[error("Job {job_id} already finished with status {status:?}")]
    JobFinished { job_id: JobId, status: JobStatus },
}

impl From<CoreError> for OrchestratorError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Validation(msg) => Self::InvalidConfig(msg),
        }
    }
}
