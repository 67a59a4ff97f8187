//! One-shot executor tests against real `sh` scripts standing in for
//! worker binaries.

use std::path::Path;
use std::time::Duration;

use assert_matches::assert_matches;
use kiln_core::lifecycle::ExecutionMode;
use kiln_core::request::{GenerationRequest, JobType};
use kiln_core::worker::WorkerConfig;
use kiln_exec::executor::DEFAULT_TIMEOUT;
use kiln_exec::{ExecError, OneShotExecutor};
use tempfile::TempDir;

/// A worker config running `script` through `sh`.
fn script_worker(dir: &TempDir, script: &str) -> WorkerConfig {
    let path = dir.path().join("worker.sh");
    std::fs::write(&path, script).expect("write script");
    WorkerConfig::new("sd", "sh", ExecutionMode::Cli).with_args([path.display().to_string()])
}

fn executor(dir: &TempDir, timeout: Duration) -> OneShotExecutor {
    OneShotExecutor::new(dir.path().to_path_buf(), dir.path().join("outputs"), timeout)
}

/// Writes its payload to whatever `--output` names.
const WRITES_REQUESTED_OUTPUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; fi
  shift
done
echo "sampling..."
printf 'PNGDATA' > "$out"
"#;

fn dir_is_empty(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_none())
        .unwrap_or(true)
}

#[tokio::test]
async fn reads_requested_output_and_deletes_it() {
    let dir = TempDir::new().expect("tempdir");
    let config = script_worker(&dir, WRITES_REQUESTED_OUTPUT);
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let artifact = exec
        .generate(&config, &GenerationRequest::new("a lighthouse"))
        .await
        .expect("generation succeeds");

    assert_eq!(artifact, b"PNGDATA");
    assert!(dir_is_empty(&dir.path().join("outputs")));
}

#[tokio::test]
async fn announced_path_wins_over_requested() {
    let dir = TempDir::new().expect("tempdir");
    let config = script_worker(
        &dir,
        "printf 'ANNOUNCED' > outputs/announced.png\necho \"Saved image to: outputs/announced.png\"\n",
    );
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let artifact = exec
        .generate(&config, &GenerationRequest::new("a lighthouse"))
        .await
        .expect("generation succeeds");

    assert_eq!(artifact, b"ANNOUNCED");
    assert!(dir_is_empty(&dir.path().join("outputs")));
}

#[tokio::test]
async fn announcement_on_stderr_beats_bare_path_on_stdout() {
    let dir = TempDir::new().expect("tempdir");
    let real = dir.path().join("outputs").join("real.png");
    let script = format!(
        "echo 'preview cached at /nonexistent/preview.png'\n\
         printf 'REAL' > {0}\n\
         echo \"Saved image to: {0}\" >&2\n",
        real.display()
    );
    let config = script_worker(&dir, &script);
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let artifact = exec
        .generate(&config, &GenerationRequest::new("a lighthouse"))
        .await
        .expect("generation succeeds");

    assert_eq!(artifact, b"REAL");
    assert!(dir_is_empty(&dir.path().join("outputs")));
}

#[tokio::test]
async fn logged_source_image_is_neither_returned_nor_deleted() {
    let dir = TempDir::new().expect("tempdir");
    let source = dir.path().join("user_source.png");
    std::fs::write(&source, "USER_PHOTO").expect("write source");
    let script = format!(
        "echo \"loading reference image {}\"\n{WRITES_REQUESTED_OUTPUT}",
        source.display()
    );
    let config = script_worker(&dir, &script);
    let exec = executor(&dir, DEFAULT_TIMEOUT);
    let request = GenerationRequest {
        job_type: JobType::Edit,
        source_image: Some(source.display().to_string()),
        ..GenerationRequest::new("make it sunset")
    };

    let artifact = exec.generate(&config, &request).await.expect("generation succeeds");

    assert_eq!(artifact, b"PNGDATA");
    assert_eq!(std::fs::read(&source).expect("source kept"), b"USER_PHOTO");
    assert!(dir_is_empty(&dir.path().join("outputs")));
}

#[tokio::test]
async fn printed_path_outside_output_dir_is_read_but_kept() {
    let dir = TempDir::new().expect("tempdir");
    let kept = dir.path().join("gallery.png");
    let script = format!("printf 'GALLERY' > {0}\necho \"wrote {0}\"\n", kept.display());
    let config = script_worker(&dir, &script);
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let artifact = exec
        .generate(&config, &GenerationRequest::new("a lighthouse"))
        .await
        .expect("generation succeeds");

    assert_eq!(artifact, b"GALLERY");
    assert!(kept.exists());
}

#[tokio::test]
async fn non_zero_exit_carries_stderr() {
    let dir = TempDir::new().expect("tempdir");
    let script = format!("{WRITES_REQUESTED_OUTPUT}\necho 'out of memory' >&2\nexit 1\n");
    let config = script_worker(&dir, &script);
    let exec = executor(&dir, DEFAULT_TIMEOUT);
    let output_path = dir.path().join("outputs").join("failed.png");
    let invocation = exec
        .build_invocation(&config, &GenerationRequest::new("cat"), output_path.clone())
        .expect("invocation");

    let result = exec.execute(&invocation).await;

    assert_matches!(
        result,
        Err(ExecError::ProcessFailed { exit_code: 1, ref stderr }) if stderr.contains("out of memory")
    );
    // The partial output is neither read nor removed.
    assert_eq!(std::fs::read(&output_path).expect("output untouched"), b"PNGDATA");
}

#[tokio::test]
async fn missing_artifact_is_a_read_error() {
    let dir = TempDir::new().expect("tempdir");
    let config = script_worker(&dir, "echo 'finished without writing'\n");
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let result = exec.generate(&config, &GenerationRequest::new("cat")).await;

    assert_matches!(result, Err(ExecError::ArtifactRead { .. }));
}

#[tokio::test]
async fn slow_command_is_killed_at_timeout() {
    let dir = TempDir::new().expect("tempdir");
    let config = script_worker(&dir, "echo 'loading model' >&2\nsleep 10\n");
    let exec = executor(&dir, Duration::from_millis(300));

    let started = std::time::Instant::now();
    let result = exec.generate(&config, &GenerationRequest::new("cat")).await;

    let error = result.expect_err("timed out");
    assert!(error.to_string().contains("loading model"), "{error}");
    assert_matches!(error, ExecError::Timeout { elapsed_ms, .. } if elapsed_ms >= 300);
    assert!(started.elapsed() < Duration::from_secs(8));
}

#[tokio::test]
async fn missing_binary_fails_to_spawn() {
    let dir = TempDir::new().expect("tempdir");
    let config = WorkerConfig::new("sd", "/nonexistent/kiln-worker", ExecutionMode::Cli);
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let result = exec.generate(&config, &GenerationRequest::new("cat")).await;

    assert_matches!(result, Err(ExecError::Spawn { .. }));
}

#[tokio::test]
async fn runs_in_project_root() {
    let dir = TempDir::new().expect("tempdir");
    let config = script_worker(&dir, "pwd > cwd.txt\nprintf 'X' > out.png\necho \"Output: out.png\"\n");
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    exec.generate(&config, &GenerationRequest::new("cat"))
        .await
        .expect("generation succeeds");

    let cwd = std::fs::read_to_string(dir.path().join("cwd.txt")).expect("cwd written");
    let expected = dir.path().canonicalize().expect("canonical");
    assert_eq!(Path::new(cwd.trim()).canonicalize().expect("canonical"), expected);
}

#[tokio::test]
async fn availability_probe() {
    let dir = TempDir::new().expect("tempdir");
    let exec = executor(&dir, DEFAULT_TIMEOUT);

    let missing = WorkerConfig::new("sd", "/nonexistent/kiln-worker", ExecutionMode::Cli);
    assert!(!exec.is_available(&missing).await);

    let failing = WorkerConfig::new("sd", "false", ExecutionMode::Cli);
    assert!(!exec.is_available(&failing).await);

    let present = WorkerConfig::new("sd", "true", ExecutionMode::Cli);
    assert!(exec.is_available(&present).await);
}
