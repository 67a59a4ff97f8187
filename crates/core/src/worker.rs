//! Static worker configuration as supplied by the model configuration.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::lifecycle::ExecutionMode;

/// Endpoint that server-mode workers accept generation requests on.
pub const DEFAULT_SERVER_ENDPOINT: &str = "/generate";

/// Placeholder substituted with the allocated port in server arguments.
pub const PORT_PLACEHOLDER: &str = "{port}";

/// Maximum length of a worker id.
const MAX_WORKER_ID_LEN: usize = 128;

/// An inclusive range of TCP ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Result<Self, CoreError> {
        if start == 0 || start > end {
            return Err(CoreError::Validation(format!(
                "Invalid port range {start}-{end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    pub fn iter(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

/// How to launch one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub id: String,
    /// Executable to run, resolved against the project root when relative.
    pub command: String,
    /// Arguments placed before any request-derived flags.
    #[serde(default)]
    pub args: Vec<String>,
    pub execution_mode: ExecutionMode,
    /// Fixed port for server mode.
    #[serde(default)]
    pub port: Option<u16>,
    /// Range to allocate from in server mode when no fixed port is set.
    #[serde(default)]
    pub port_range: Option<PortRange>,
    /// Path requests are posted to in server mode.
    #[serde(default)]
    pub server_endpoint: Option<String>,
}

impl WorkerConfig {
    pub fn new(id: impl Into<String>, command: impl Into<String>, mode: ExecutionMode) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            execution_mode: mode,
            port: None,
            port_range: None,
            server_endpoint: None,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn endpoint(&self) -> &str {
        self.server_endpoint
            .as_deref()
            .unwrap_or(DEFAULT_SERVER_ENDPOINT)
    }

    /// Server arguments with the port filled in.
    ///
    /// Every `{port}` placeholder is replaced. Without a placeholder,
    /// `--port <port>` is appended.
    pub fn server_args(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        if self.args.iter().any(|a| a.contains(PORT_PLACEHOLDER)) {
            self.args
                .iter()
                .map(|a| a.replace(PORT_PLACEHOLDER, &port))
                .collect()
        } else {
            let mut args = self.args.clone();
            args.push("--port".to_string());
            args.push(port);
            args
        }
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        validate_worker_id(&self.id)?;
        if self.command.trim().is_empty() {
            return Err(CoreError::Validation(format!(
                "Worker '{}' has an empty command",
                self.id
            )));
        }
        if self.port == Some(0) {
            return Err(CoreError::Validation(format!(
                "Worker '{}' has port 0",
                self.id
            )));
        }
        if let Some(range) = self.port_range {
            PortRange::new(range.start, range.end).map_err(|CoreError::Validation(msg)| {
                CoreError::Validation(format!("Worker '{}': {msg}", self.id))
            })?;
        }
        Ok(())
    }
}

/// Validate a worker id.
///
/// Must be non-empty, at most 128 characters, and free of whitespace.
pub fn validate_worker_id(id: &str) -> Result<(), CoreError> {
    if id.is_empty() {
        return Err(CoreError::Validation(
            "Worker id must not be empty".to_string(),
        ));
    }
    if id.len() > MAX_WORKER_ID_LEN {
        return Err(CoreError::Validation(format!(
            "Worker id must not exceed {MAX_WORKER_ID_LEN} characters"
        )));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(CoreError::Validation(format!(
            "Worker id '{id}' must not contain whitespace"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
