use std::path::PathBuf;

/// Longest stderr tail quoted in a timeout message.
const STDERR_EXCERPT_BYTES: usize = 2048;

/// Errors from building or running a one-shot invocation.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// The worker configuration or request cannot form a command line.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The process ran past its deadline and was killed.
    #[error("Command timed out after {elapsed_ms}ms{}", stderr_excerpt(stderr))]
    Timeout { elapsed_ms: u64, stderr: String },

    /// The process exited non-zero. `exit_code` is -1 when it was killed
    /// by a signal.
    #[error("Command exited with code {exit_code}: {stderr}")]
    ProcessFailed { exit_code: i32, stderr: String },

    #[error("Failed to prepare output directory {}: {source}", path.display())]
    OutputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read artifact {}: {source}", path.display())]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<kiln_core::error::CoreError> for ExecError {
    fn from(e: kiln_core::error::CoreError) -> Self {
        match e {
            kiln_core::error::CoreError::Validation(msg) => Self::InvalidRequest(msg),
        }
    }
}

/// `": <tail of stderr>"`, or nothing when stderr is empty.
fn stderr_excerpt(stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        return String::new();
    }
    let mut start = stderr.len().saturating_sub(STDERR_EXCERPT_BYTES);
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    let ellipsis = if start > 0 { "..." } else { "" };
    format!(": {ellipsis}{}", &stderr[start..])
}
