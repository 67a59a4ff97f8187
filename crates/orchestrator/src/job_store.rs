//! The job store collaborator.
//!
//! The store is the durable record of every job's status; completion
//! signals are only an in-process fast path layered on top of it.
//! [`InMemoryJobStore`] backs tests and the standalone binary.

use std::collections::HashMap;

use async_trait::async_trait;
use kiln_core::job::JobRecord;
use kiln_core::types::JobId;
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),

    #[error("Job {0} already exists")]
    Duplicate(JobId),

    /// Failure inside the backing storage.
    #[error("Job store backend error: {0}")]
    Backend(String),
}

/// Persistence for job records, keyed by job id.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError>;

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError>;

    /// Replace an existing record.
    async fn update(&self, record: JobRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(StoreError::Duplicate(record.id));
        }
        jobs.insert(record.id.clone(), record);
        Ok(())
    }

    async fn get(&self, job_id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.jobs.read().await.get(job_id).cloned())
    }

    async fn update(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&record.id) {
            Some(existing) => {
                *existing = record;
                Ok(())
            }
            None => Err(StoreError::NotFound(record.id)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use kiln_core::job::JobStatus;
    use kiln_core::request::GenerationRequest;

    use super::*;

    #[tokio::test]
    async fn create_get_update() {
        let store = InMemoryJobStore::new();
        let mut record = JobRecord::new("job-1", "w1", GenerationRequest::new("cat"));
        store.create(record.clone()).await.expect("create");

        record.status = JobStatus::Running;
        store.update(record).await.expect("update");

        let stored = store.get("job-1").await.expect("get").expect("present");
        assert_eq!(stored.status, JobStatus::Running);
        assert!(store.get("job-2").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let store = InMemoryJobStore::new();
        let record = JobRecord::new("job-1", "w1", GenerationRequest::new("cat"));
        store.create(record.clone()).await.expect("create");
        assert_matches!(store.create(record).await, Err(StoreError::Duplicate(id)) if id == "job-1");
    }

    #[tokio::test]
    async fn update_of_unknown_job_fails() {
        let store = InMemoryJobStore::new();
        let record = JobRecord::new("ghost", "w1", GenerationRequest::new("cat"));
        assert_matches!(store.update(record).await, Err(StoreError::NotFound(_)));
    }
}
