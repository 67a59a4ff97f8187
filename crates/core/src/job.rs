//! Job records as exchanged with the external job store.

use serde::{Deserialize, Serialize};

use crate::request::GenerationRequest;
use crate::types::{JobId, Timestamp, WorkerId};

/// Lifecycle status of a job. The job store is the durable record of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// A job as persisted by the job store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub worker_id: WorkerId,
    pub status: JobStatus,
    pub request: GenerationRequest,
    /// Size of the produced artifact, once completed.
    pub artifact_bytes: Option<u64>,
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl JobRecord {
    pub fn new(id: impl Into<JobId>, worker_id: impl Into<WorkerId>, request: GenerationRequest) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: id.into(),
            worker_id: worker_id.into(),
            status: JobStatus::Pending,
            request,
            artifact_bytes: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The outcome delivered to callers waiting on a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationResult {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub artifact: Vec<u8>,
    pub completed_at: Timestamp,
}
