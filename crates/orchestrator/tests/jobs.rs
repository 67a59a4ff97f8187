//! Job runs through the one-shot path: store persistence, waiter release,
//! cancellation and events.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use kiln_core::job::{JobRecord, JobStatus};
use kiln_core::lifecycle::ExecutionMode;
use kiln_core::request::GenerationRequest;
use kiln_core::worker::WorkerConfig;
use kiln_events::{OrchestratorEvent, WaitError};
use kiln_orchestrator::{InMemoryJobStore, JobStore, Orchestrator, OrchestratorConfig, OrchestratorError};
use tempfile::TempDir;

const WRITES_REQUESTED_OUTPUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; fi
  shift
done
printf 'PNGDATA' > "$out"
"#;

fn orchestrator(dir: &TempDir) -> Arc<Orchestrator> {
    let root = dir.path().display().to_string();
    let config = OrchestratorConfig::from_lookup(|key| (key == "KILN_PROJECT_ROOT").then(|| root.clone()));
    Orchestrator::start(config, Arc::new(InMemoryJobStore::new()))
}

fn cli_worker(dir: &TempDir, script: &str) -> WorkerConfig {
    std::fs::write(dir.path().join("worker.sh"), script).expect("write script");
    WorkerConfig::new("sd", "sh", ExecutionMode::Cli).with_args(["worker.sh"])
}

async fn create_job(orchestrator: &Orchestrator, job_id: &str) {
    orchestrator
        .store()
        .create(JobRecord::new(job_id, "sd", GenerationRequest::new("a lighthouse")))
        .await
        .expect("create job");
}

async fn status_of(orchestrator: &Orchestrator, job_id: &str) -> JobRecord {
    orchestrator
        .get_job(job_id)
        .await
        .expect("store")
        .expect("job exists")
}

#[tokio::test]
async fn completed_job_releases_waiter_after_persisting() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);
    create_job(&orchestrator, "job-1").await;

    let (waited, ran) = tokio::join!(
        orchestrator.wait_for_job("job-1", Duration::from_secs(10)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.run_job("job-1", &worker).await
        }
    );

    let result = waited.expect("waiter resolved");
    assert_eq!(result.artifact, b"PNGDATA");
    assert_eq!(result.worker_id, "sd");
    assert_eq!(ran.expect("job ran").artifact, b"PNGDATA");

    let record = status_of(&orchestrator, "job-1").await;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.artifact_bytes, Some(7));
    assert_eq!(orchestrator.pending_waiters(), 0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn failed_job_rejects_waiter_with_stderr() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, "echo 'out of memory' >&2\nexit 1\n");
    create_job(&orchestrator, "job-2").await;

    let (waited, ran) = tokio::join!(
        orchestrator.wait_for_job("job-2", Duration::from_secs(10)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.run_job("job-2", &worker).await
        }
    );

    assert_matches!(waited, Err(WaitError::Failed(ref reason)) if reason.contains("out of memory"));
    assert_matches!(ran, Err(OrchestratorError::Exec(_)));

    let record = status_of(&orchestrator, "job-2").await;
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.as_deref().is_some_and(|e| e.contains("out of memory")));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancelled_job_stays_cancelled() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);
    create_job(&orchestrator, "job-3").await;

    let (waited, cancelled) = tokio::join!(
        orchestrator.wait_for_job("job-3", Duration::from_secs(10)),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            orchestrator.cancel_job("job-3").await
        }
    );

    assert_matches!(waited, Err(WaitError::Cancelled(_)));
    assert!(cancelled.expect("cancel"));
    assert!(!orchestrator.cancel_job("job-3").await.expect("second cancel"));

    assert_matches!(
        orchestrator.run_job("job-3", &worker).await,
        Err(OrchestratorError::JobFinished { status: JobStatus::Cancelled, .. })
    );
    assert_eq!(status_of(&orchestrator, "job-3").await.status, JobStatus::Cancelled);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn cancel_after_completion_is_ignored() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);
    create_job(&orchestrator, "job-4").await;

    orchestrator.run_job("job-4", &worker).await.expect("job ran");

    assert!(!orchestrator.cancel_job("job-4").await.expect("cancel"));
    assert_eq!(status_of(&orchestrator, "job-4").await.status, JobStatus::Completed);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn submitted_job_runs_in_background_and_publishes() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);
    let mut events = orchestrator.subscribe();

    let (job_id, handle) = orchestrator
        .submit_job(worker, GenerationRequest::new("a lighthouse"))
        .await
        .expect("submitted");
    let result = handle.await.expect("join").expect("job ran");
    assert_eq!(result.job_id, job_id);

    let completed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(OrchestratorEvent::JobCompleted { job_id, artifact_bytes, .. }) = events.recv().await {
                return (job_id, artifact_bytes);
            }
        }
    })
    .await
    .expect("completion event");
    assert_eq!(completed, (job_id.clone(), 7));
    assert_eq!(status_of(&orchestrator, &job_id).await.status, JobStatus::Completed);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);

    assert_matches!(
        orchestrator.run_job("nope", &worker).await,
        Err(OrchestratorError::Store(_))
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn one_shot_generation_without_a_job() {
    let dir = TempDir::new().expect("tempdir");
    let orchestrator = orchestrator(&dir);
    let worker = cli_worker(&dir, WRITES_REQUESTED_OUTPUT);

    let artifact = orchestrator
        .generate_via_one_shot(&worker, &GenerationRequest::new("cat"))
        .await
        .expect("generated");
    assert_eq!(artifact, b"PNGDATA");

    orchestrator.shutdown().await;
}
