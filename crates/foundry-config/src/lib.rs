//! Layered configuration for the `foundryd` service.
//!
//! Configuration is resolved in four layers, each overriding the last:
//! compiled-in defaults, an optional `.foundry.toml` file, environment
//! variables (`FOUNDRY_*`), then CLI flags. Only the CLI-flag layer is
//! optional at the call site (a bare service with no flags still gets
//! defaults/file/env).

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use foundry_retry::BackoffConfig;

/// Pool-related tuning: default per-executor capacity and circuit breaker
/// thresholds, per §4.1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_capacity")]
    pub default_capacity: u32,
    #[serde(default = "default_failure_threshold")]
    pub circuit_failure_threshold: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_recovery_timeout")]
    pub circuit_recovery_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: default_capacity(),
            circuit_failure_threshold: default_failure_threshold(),
            circuit_recovery_timeout: default_recovery_timeout(),
        }
    }
}

fn default_capacity() -> u32 {
    4
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_timeout() -> Duration {
    Duration::from_secs(30)
}

/// Scheduler tuning: how many rows may be dispatched at once and how long
/// to sleep between wake checks when idle, per §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: u32,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_tick_interval")]
    pub tick_interval: Duration,
    /// Pacing between re-attempts to claim a row after a transient failure
    /// to acquire an executor (e.g. every backend at capacity).
    #[serde(default)]
    pub claim_backoff: BackoffConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            tick_interval: default_tick_interval(),
            claim_backoff: BackoffConfig::default(),
        }
    }
}

fn default_max_concurrent() -> u32 {
    16
}

fn default_tick_interval() -> Duration {
    Duration::from_millis(250)
}

/// Execution Adapter tuning: per-invocation HTTP timeout, per §4.6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration"
    )]
    #[serde(default = "default_invoke_timeout")]
    pub invoke_timeout: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            invoke_timeout: default_invoke_timeout(),
        }
    }
}

fn default_invoke_timeout() -> Duration {
    Duration::from_secs(120)
}

/// Submission API tuning: the hard body-size cap from §4.7.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_max_body_bytes() -> u64 {
    2 * 1024 * 1024
}

/// Top-level service configuration, loaded from `.foundry.toml` if present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Address the Submission API binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Directory for the append-only event log.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            state_dir: default_state_dir(),
            pool: PoolConfig::default(),
            scheduler: SchedulerConfig::default(),
            exec: ExecConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".foundry")
}

/// Flag-level overrides supplied on the command line. `None` means "not
/// given on the CLI, defer to file/env/default".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub listen_addr: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub default_capacity: Option<u32>,
    pub circuit_failure_threshold: Option<u32>,
    pub circuit_recovery_timeout: Option<Duration>,
    pub max_concurrent: Option<u32>,
    pub invoke_timeout: Option<Duration>,
    pub max_body_bytes: Option<u64>,
}

impl ServiceConfig {
    /// Look for `.foundry.toml` under `workspace_root`; returns `Ok(None)`
    /// if it does not exist.
    pub fn load_from_workspace(workspace_root: &Path) -> Result<Option<Self>> {
        let config_path = workspace_root.join(".foundry.toml");
        if !config_path.exists() {
            return Ok(None);
        }
        Self::load_from_file(&config_path).map(Some)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))
    }

    /// Overlay `FOUNDRY_*` environment variables onto this configuration.
    /// Unset or unparsable variables are left untouched rather than
    /// treated as errors, matching the permissive env layer a long-running
    /// service wants.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("FOUNDRY_LISTEN_ADDR") {
            self.listen_addr = v;
        }
        if let Ok(v) = std::env::var("FOUNDRY_STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("FOUNDRY_POOL_DEFAULT_CAPACITY")
            && let Ok(parsed) = v.parse()
        {
            self.pool.default_capacity = parsed;
        }
        if let Ok(v) = std::env::var("FOUNDRY_POOL_CIRCUIT_FAILURE_THRESHOLD")
            && let Ok(parsed) = v.parse()
        {
            self.pool.circuit_failure_threshold = parsed;
        }
        if let Ok(v) = std::env::var("FOUNDRY_POOL_CIRCUIT_RECOVERY_TIMEOUT")
            && let Ok(parsed) = humantime::parse_duration(&v)
        {
            self.pool.circuit_recovery_timeout = parsed;
        }
        if let Ok(v) = std::env::var("FOUNDRY_SCHEDULER_MAX_CONCURRENT")
            && let Ok(parsed) = v.parse()
        {
            self.scheduler.max_concurrent = parsed;
        }
        if let Ok(v) = std::env::var("FOUNDRY_EXEC_INVOKE_TIMEOUT")
            && let Ok(parsed) = humantime::parse_duration(&v)
        {
            self.exec.invoke_timeout = parsed;
        }
        if let Ok(v) = std::env::var("FOUNDRY_API_MAX_BODY_BYTES")
            && let Ok(parsed) = v.parse()
        {
            self.api.max_body_bytes = parsed;
        }
    }

    /// Merge CLI overrides in, taking precedence over file/env/default.
    pub fn apply_cli(&mut self, cli: CliOverrides) {
        if let Some(v) = cli.listen_addr {
            self.listen_addr = v;
        }
        if let Some(v) = cli.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = cli.default_capacity {
            self.pool.default_capacity = v;
        }
        if let Some(v) = cli.circuit_failure_threshold {
            self.pool.circuit_failure_threshold = v;
        }
        if let Some(v) = cli.circuit_recovery_timeout {
            self.pool.circuit_recovery_timeout = v;
        }
        if let Some(v) = cli.max_concurrent {
            self.scheduler.max_concurrent = v;
        }
        if let Some(v) = cli.invoke_timeout {
            self.exec.invoke_timeout = v;
        }
        if let Some(v) = cli.max_body_bytes {
            self.api.max_body_bytes = v;
        }
    }

    /// Resolve the full four-layer configuration: defaults, optional file,
    /// env, then CLI.
    pub fn layered(workspace_root: &Path, cli: CliOverrides) -> Result<Self> {
        let mut config = Self::load_from_workspace(workspace_root)?.unwrap_or_default();
        config.apply_env();
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool.default_capacity == 0 {
            bail!("pool.default_capacity must be greater than 0");
        }
        if self.pool.circuit_failure_threshold == 0 {
            bail!("pool.circuit_failure_threshold must be greater than 0");
        }
        if self.pool.circuit_recovery_timeout.is_zero() {
            bail!("pool.circuit_recovery_timeout must be greater than 0");
        }
        if self.scheduler.max_concurrent == 0 {
            bail!("scheduler.max_concurrent must be greater than 0");
        }
        if self.scheduler.tick_interval.is_zero() {
            bail!("scheduler.tick_interval must be greater than 0");
        }
        if self.exec.invoke_timeout.is_zero() {
            bail!("exec.invoke_timeout must be greater than 0");
        }
        if self.listen_addr.is_empty() {
            bail!("listen_addr cannot be empty");
        }
        if self.api.max_body_bytes == 0 {
            bail!("api.max_body_bytes must be greater than 0");
        }
        Ok(())
    }
}

fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}
