//! Job execution on top of the dispatcher and the job store.
//!
//! Every terminal status is persisted to the [`JobStore`] before the
//! completion notifier is signalled, so a released waiter can always find
//! the outcome in the store. A job that is already terminal is never
//! overwritten: whichever of completion, failure or cancellation is
//! recorded first wins.

use std::sync::Arc;

use chrono::Utc;
use kiln_core::job::{GenerationResult, JobRecord, JobStatus};
use kiln_core::request::GenerationRequest;
use kiln_core::types::JobId;
use kiln_core::worker::WorkerConfig;
use kiln_events::OrchestratorEvent;
use tokio::task::JoinHandle;

use crate::error::OrchestratorError;
use crate::job_store::{JobStore, StoreError};
use crate::orchestrator::Orchestrator;

impl Orchestrator {
    /// Create a pending job for `worker` and run it in the background.
    ///
    /// Returns the new job id and the handle of the running job.
    pub async fn submit_job(
        self: &Arc<Self>,
        worker: WorkerConfig,
        request: GenerationRequest,
    ) -> Result<(JobId, JoinHandle<Result<GenerationResult, OrchestratorError>>), OrchestratorError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create(JobRecord::new(job_id.clone(), worker.id.clone(), request))
            .await?;

        let this = Arc::clone(self);
        let id = job_id.clone();
        let handle = tokio::spawn(async move { this.run_job(&id, &worker).await });
        Ok((job_id, handle))
    }

    /// Run a stored job on `worker` and record its outcome.
    ///
    /// The job is marked `running`, dispatched, and finally persisted as
    /// `completed` or `failed` before waiters are released.
    pub async fn run_job(
        &self,
        job_id: &str,
        worker: &WorkerConfig,
    ) -> Result<GenerationResult, OrchestratorError> {
        let record = self
            .transition(job_id, |r| r.status = JobStatus::Running)
            .await?;
        tracing::info!(job_id, worker_id = %worker.id, mode = %worker.execution_mode, "Job started");

        match self.dispatcher.dispatch(worker, &record.request).await {
            Ok(artifact) => {
                let artifact_bytes = artifact.len() as u64;
                self.transition(job_id, |r| {
                    r.status = JobStatus::Completed;
                    r.artifact_bytes = Some(artifact_bytes);
                })
                .await?;

                let result = GenerationResult {
                    job_id: job_id.to_string(),
                    worker_id: worker.id.clone(),
                    artifact,
                    completed_at: Utc::now(),
                };
                tracing::info!(job_id, worker_id = %worker.id, artifact_bytes, "Job completed");
                self.event_bus.publish(OrchestratorEvent::JobCompleted {
                    job_id: job_id.to_string(),
                    worker_id: worker.id.clone(),
                    artifact_bytes,
                });
                self.notifier.signal_completed(job_id, result.clone());
                Ok(result)
            }
            Err(e) => {
                let error = e.to_string();
                self.transition(job_id, |r| {
                    r.status = JobStatus::Failed;
                    r.error = Some(error.clone());
                })
                .await?;

                tracing::error!(job_id, worker_id = %worker.id, error = %error, "Job failed");
                self.event_bus.publish(OrchestratorEvent::JobFailed {
                    job_id: job_id.to_string(),
                    error: error.clone(),
                });
                self.notifier.signal_failed(job_id, error);
                Err(e)
            }
        }
    }

    /// Cancel a job that has not finished yet.
    ///
    /// Returns `false` if the job was already terminal.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool, OrchestratorError> {
        match self
            .transition(job_id, |r| r.status = JobStatus::Cancelled)
            .await
        {
            Ok(_) => {}
            Err(OrchestratorError::JobFinished { status, .. }) => {
                tracing::debug!(job_id, status = ?status, "Cancel ignored, job already finished");
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(job_id, "Job cancelled");
        self.event_bus.publish(OrchestratorEvent::JobCancelled {
            job_id: job_id.to_string(),
        });
        self.notifier.signal_cancelled(job_id);
        Ok(true)
    }

    /// Current record of a job, if the store knows it.
    pub async fn get_job(&self, job_id: &str) -> Result<Option<JobRecord>, OrchestratorError> {
        Ok(self.store.get(job_id).await?)
    }

    // ---- private helpers ----

    async fn load_job(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()).into())
    }

    /// Apply a status change unless the job is already terminal, and
    /// return the stored record.
    ///
    /// Transitions are serialised so a completion and a cancellation
    /// racing on one job cannot both be recorded.
    async fn transition(
        &self,
        job_id: &str,
        apply: impl FnOnce(&mut JobRecord),
    ) -> Result<JobRecord, OrchestratorError> {
        let _guard = self.job_transitions.lock().await;
        let mut record = self.load_job(job_id).await?;
        if record.status.is_terminal() {
            tracing::debug!(
                job_id,
                status = ?record.status,
                "Job already finished, keeping recorded outcome",
            );
            return Err(OrchestratorError::JobFinished {
                job_id: job_id.to_string(),
                status: record.status,
            });
        }
        apply(&mut record);
        record.updated_at = Utc::now();
        self.store.update(record.clone()).await?;
        Ok(record)
    }
}
