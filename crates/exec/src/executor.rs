//! Spawning one-shot invocations and collecting their artifacts.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use kiln_core::artifact::scan_output;
use kiln_core::request::{GenerationRequest, JobType};
use kiln_core::worker::WorkerConfig;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::error::ExecError;
use crate::invocation::{build_args, input_paths, resolve_program, CommandInvocation};

/// Default wall-clock bound on a one-shot invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Bound on the `--version` probe used by [`OneShotExecutor::is_available`].
pub const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum output captured per stream (10 MiB). Further lines are logged
/// but not kept.
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;

/// How long to keep reading output after the process is gone. Grandchildren
/// can hold the pipes open past the parent's exit.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs worker binaries once per job.
#[derive(Debug, Clone)]
pub struct OneShotExecutor {
    project_root: PathBuf,
    output_dir: PathBuf,
    timeout: Duration,
}

impl OneShotExecutor {
    /// `project_root` is the working directory of every invocation;
    /// `output_dir` receives requested artifact paths.
    pub fn new(project_root: PathBuf, output_dir: PathBuf, timeout: Duration) -> Self {
        Self {
            project_root,
            output_dir,
            timeout,
        }
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// A fresh, unique artifact path in the output directory.
    pub fn fresh_output_path(&self, job_type: JobType) -> PathBuf {
        self.output_dir.join(format!(
            "{}.{}",
            uuid::Uuid::new_v4(),
            job_type.artifact_extension()
        ))
    }

    /// Compose the invocation for `request`, writing to `output_path`.
    ///
    /// The seed is drawn at random when the request carries none.
    pub fn build_invocation(
        &self,
        config: &WorkerConfig,
        request: &GenerationRequest,
        output_path: PathBuf,
    ) -> Result<CommandInvocation, ExecError> {
        config.validate()?;
        let args = build_args(config, request, request.resolved_seed(), &output_path)?;
        Ok(CommandInvocation {
            program: resolve_program(&config.command, &self.project_root),
            args,
            working_dir: self.project_root.clone(),
            timeout: self.timeout,
            output_path,
            input_paths: input_paths(request, &self.project_root),
        })
    }

    /// Run `invocation` to completion and return the artifact's bytes.
    ///
    /// After a successful run the requested output file is deleted whether
    /// or not reading succeeded. An announced artifact elsewhere is deleted
    /// only when it lies inside the output directory.
    pub async fn execute(&self, invocation: &CommandInvocation) -> Result<Vec<u8>, ExecError> {
        if let Some(dir) = invocation.output_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| ExecError::OutputDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        let program = invocation.program.display().to_string();
        tracing::info!(
            program = %program,
            arg_count = invocation.args.len(),
            working_dir = %invocation.working_dir.display(),
            timeout_secs = invocation.timeout.as_secs(),
            "Running one-shot command",
        );

        let start = Instant::now();
        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .current_dir(&invocation.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdout_task = tokio::spawn(collect_lines(child.stdout.take(), "stdout", pid));
        let stderr_task = tokio::spawn(collect_lines(child.stderr.take(), "stderr", pid));

        let status = match tokio::time::timeout(invocation.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(source)) => return Err(ExecError::Spawn { program, source }),
            Err(_elapsed) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                if let Err(e) = child.kill().await {
                    tracing::warn!(pid, error = %e, "Failed to kill timed out command");
                }
                let stderr = drain(stderr_task).await;
                tracing::error!(program = %program, pid, elapsed_ms, "One-shot command timed out");
                return Err(ExecError::Timeout {
                    elapsed_ms,
                    stderr: stderr.trim().to_string(),
                });
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;
        let exit_code = status.code().unwrap_or(-1);

        if !status.success() {
            tracing::error!(program = %program, pid, exit_code, duration_ms, "One-shot command failed");
            return Err(ExecError::ProcessFailed {
                exit_code,
                stderr: stderr.trim().to_string(),
            });
        }
        tracing::info!(program = %program, pid, exit_code, duration_ms, "One-shot command finished");

        let artifact_path = self.locate_artifact(&stdout, &stderr, invocation).await;
        let read = tokio::fs::read(&artifact_path).await;
        remove_artifact(&invocation.output_path).await;
        if artifact_path != invocation.output_path {
            if self.owns(&artifact_path, invocation) {
                remove_artifact(&artifact_path).await;
            } else {
                tracing::debug!(
                    path = %artifact_path.display(),
                    "Artifact lies outside the output directory, leaving it in place",
                );
            }
        }

        read.map_err(|source| ExecError::ArtifactRead {
            path: artifact_path,
            source,
        })
    }

    /// Build and execute in one step, writing to a fresh output path.
    pub async fn generate(
        &self,
        config: &WorkerConfig,
        request: &GenerationRequest,
    ) -> Result<Vec<u8>, ExecError> {
        let output_path = self.fresh_output_path(request.job_type);
        let invocation = self.build_invocation(config, request, output_path)?;
        let artifact = self.execute(&invocation).await?;
        tracing::info!(
            worker_id = %config.id,
            artifact_bytes = artifact.len(),
            "One-shot generation complete",
        );
        Ok(artifact)
    }

    /// Whether `config.command --version` exits successfully within
    /// [`VERSION_PROBE_TIMEOUT`]. Diagnostic only.
    pub async fn is_available(&self, config: &WorkerConfig) -> bool {
        let program = resolve_program(&config.command, &self.project_root);
        let mut cmd = Command::new(&program);
        cmd.arg("--version")
            .current_dir(&self.project_root)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, cmd.status()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                tracing::debug!(worker_id = %config.id, error = %e, "Version probe failed to spawn");
                false
            }
            Err(_elapsed) => {
                tracing::debug!(worker_id = %config.id, "Version probe timed out");
                false
            }
        }
    }

    /// Pick the artifact path.
    ///
    /// In order: a phrase announcement, the requested output path if the
    /// worker wrote it, the first bare path printed, and finally the
    /// requested path. Relative paths resolve against the working dir and
    /// the request's input images are never chosen.
    async fn locate_artifact(
        &self,
        stdout: &str,
        stderr: &str,
        invocation: &CommandInvocation,
    ) -> PathBuf {
        let hints = scan_output(&[stdout, stderr]);
        let candidate = |raw: &str| {
            let path = invocation.working_dir.join(raw);
            if invocation.input_paths.contains(&path) {
                tracing::debug!(path = %path.display(), "Ignoring input image named in output");
                None
            } else {
                Some(path)
            }
        };

        if let Some(path) = hints.announced.as_deref().and_then(|raw| candidate(raw)) {
            return path;
        }
        if tokio::fs::try_exists(&invocation.output_path)
            .await
            .unwrap_or(false)
        {
            return invocation.output_path.clone();
        }
        if let Some(path) = hints.bare.iter().find_map(|raw| candidate(raw)) {
            return path;
        }

        tracing::debug!(
            output_path = %invocation.output_path.display(),
            "No artifact announced, using requested output path",
        );
        invocation.output_path.clone()
    }

    /// Whether `path` is a temporary file this executor may delete.
    fn owns(&self, path: &Path, invocation: &CommandInvocation) -> bool {
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return false;
        }
        path == invocation.output_path
            || path.starts_with(invocation.working_dir.join(&self.output_dir))
    }
}

/// Drain a stream line by line, logging each line and keeping up to
/// [`MAX_OUTPUT_BYTES`] of it.
async fn collect_lines<R: AsyncRead + Unpin>(
    stream: Option<R>,
    name: &'static str,
    pid: Option<u32>,
) -> String {
    let mut captured = String::new();
    let Some(stream) = stream else {
        return captured;
    };
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!(pid, stream = name, "{line}");
        if captured.len() + line.len() < MAX_OUTPUT_BYTES {
            captured.push_str(&line);
            captured.push('\n');
        }
    }
    captured
}

async fn drain(task: JoinHandle<String>) -> String {
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, task).await {
        Ok(Ok(captured)) => captured,
        _ => String::new(),
    }
}

async fn remove_artifact(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete artifact file");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
