use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_core::worker::PortRange;
use kiln_process::RegistryConfig;

const DEFAULT_PORT_RANGE_START: u16 = 8100;
const DEFAULT_PORT_RANGE_END: u16 = 8199;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;
const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 60;
const DEFAULT_KILL_GRACE_SECS: u64 = 5;
const DEFAULT_ONESHOT_TIMEOUT_SECS: u64 = 300;

/// Orchestrator configuration loaded from environment variables.
///
/// All fields have defaults suitable for a single local machine.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ports the allocator may hand out to server-mode workers.
    pub port_range: PortRange,
    /// Bound on one port probe.
    pub probe_timeout: Duration,
    /// Heartbeat age after which a process counts as a zombie.
    pub heartbeat_timeout: Duration,
    /// Interval of the background health sweep.
    pub health_interval: Duration,
    /// Grace between SIGTERM and SIGKILL when stopping a worker.
    pub kill_grace: Duration,
    /// Wall-clock bound on one-shot invocations and forwarded requests.
    pub oneshot_timeout: Duration,
    /// Working directory of every spawned worker.
    pub project_root: PathBuf,
    /// Where one-shot artifacts are written before being read back.
    pub output_dir: PathBuf,
    /// Optional JSON list of worker configurations to start at boot.
    pub workers_file: Option<PathBuf>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl OrchestratorConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default                 |
    /// |-------------------------------|-------------------------|
    /// | `KILN_PORT_RANGE_START`       | `8100`                  |
    /// | `KILN_PORT_RANGE_END`         | `8199`                  |
    /// | `KILN_PORT_PROBE_TIMEOUT_MS`  | `1000`                  |
    /// | `KILN_HEARTBEAT_TIMEOUT_SECS` | `60`                    |
    /// | `KILN_HEALTH_INTERVAL_SECS`   | `60`                    |
    /// | `KILN_KILL_GRACE_SECS`        | `5`                     |
    /// | `KILN_ONESHOT_TIMEOUT_SECS`   | `300`                   |
    /// | `KILN_PROJECT_ROOT`           | current directory       |
    /// | `KILN_OUTPUT_DIR`             | `<root>/outputs/tmp`    |
    /// | `KILN_WORKERS_FILE`           | unset                   |
    ///
    /// Unparseable or out-of-range values are logged and replaced by
    /// their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let start = parse_or(&lookup, "KILN_PORT_RANGE_START", DEFAULT_PORT_RANGE_START);
        let end = parse_or(&lookup, "KILN_PORT_RANGE_END", DEFAULT_PORT_RANGE_END);
        let port_range = PortRange::new(start, end).unwrap_or_else(|e| {
            tracing::warn!(start, end, error = %e, "Invalid port range, using default");
            PortRange {
                start: DEFAULT_PORT_RANGE_START,
                end: DEFAULT_PORT_RANGE_END,
            }
        });

        let project_root = lookup("KILN_PROJECT_ROOT")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));
        let output_dir = lookup("KILN_OUTPUT_DIR")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| project_root.join("outputs").join("tmp"));
        let workers_file = lookup("KILN_WORKERS_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            port_range,
            probe_timeout: Duration::from_millis(positive_or(
                &lookup,
                "KILN_PORT_PROBE_TIMEOUT_MS",
                DEFAULT_PROBE_TIMEOUT_MS,
            )),
            heartbeat_timeout: secs(&lookup, "KILN_HEARTBEAT_TIMEOUT_SECS", DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            health_interval: secs(&lookup, "KILN_HEALTH_INTERVAL_SECS", DEFAULT_HEALTH_INTERVAL_SECS),
            kill_grace: secs(&lookup, "KILN_KILL_GRACE_SECS", DEFAULT_KILL_GRACE_SECS),
            oneshot_timeout: secs(&lookup, "KILN_ONESHOT_TIMEOUT_SECS", DEFAULT_ONESHOT_TIMEOUT_SECS),
            project_root,
            output_dir,
            workers_file,
        }
    }

    /// The slice of configuration the process registry needs.
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            port_range: self.port_range,
            probe_timeout: self.probe_timeout,
            heartbeat_timeout: self.heartbeat_timeout,
            kill_grace: self.kill_grace,
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, default = %default, "Invalid config value, using default");
            default
        }),
    }
}

/// Like [`parse_or`] but rejects zero.
fn positive_or(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    match parse_or(lookup, key, default) {
        0 => {
            tracing::warn!(key, default, "Config value must be positive, using default");
            default
        }
        value => value,
    }
}

fn secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> Duration {
    Duration::from_secs(positive_or(lookup, key, default))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
