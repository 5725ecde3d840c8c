//! Configuration for a batch run.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use super::task::task_path_component;
use crate::error::ConfigError;

/// Default time to wait for a task before recording a timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(7200);

/// Default delay between completion checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration shared by every driver in one batch run.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Directory holding the submission log, agent logs and artifacts.
    pub log_dir: PathBuf,
    /// Identifier correlating every entry of this batch.
    pub run_id: String,
    /// Benchmark name, used to derive environment names.
    pub benchmark_name: String,
    /// Maximum number of environments alive at once.
    pub max_concurrent: usize,
    /// How long to wait for a task before giving up on it.
    pub timeout: Duration,
    /// Delay between completion checks.
    pub poll_interval: Duration,
    /// Local directory containing the agent's code, pushed to every environment.
    pub agent_dir: PathBuf,
    /// Agent entrypoint passed to the remote launcher.
    pub entrypoint: String,
    /// Extra arguments for the agent, written to `agent_args.json`.
    pub agent_args: Value,
    /// Benchmark-level setup script staged as `setup_script.sh`.
    pub setup_script: Option<PathBuf>,
    /// Remote account the agent runs as.
    pub remote_user: String,
    /// Provider network policy applied to every environment.
    pub network_policy: Option<String>,
    /// Copy the remote workspace back into `{log_dir}/{task_id}/`.
    pub collect_artifacts: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./results"),
            run_id: format!("run-{}", Uuid::new_v4()),
            benchmark_name: "benchmark".to_string(),
            max_concurrent: 1,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            agent_dir: PathBuf::from("./agent"),
            entrypoint: "main.run".to_string(),
            agent_args: Value::Object(serde_json::Map::new()),
            setup_script: None,
            remote_user: "agent".to_string(),
            network_policy: None,
            collect_artifacts: true,
        }
    }
}

impl RunnerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AGENT_RUNNER_LOG_DIR`: Results directory (default: ./results)
    /// - `AGENT_RUNNER_RUN_ID`: Run identifier (default: random)
    /// - `AGENT_RUNNER_BENCHMARK`: Benchmark name (default: benchmark)
    /// - `AGENT_RUNNER_MAX_CONCURRENT`: Concurrent environments (default: 1)
    /// - `AGENT_RUNNER_TIMEOUT_SECS`: Per-task timeout (default: 7200)
    /// - `AGENT_RUNNER_POLL_INTERVAL_SECS`: Completion poll interval (default: 30)
    /// - `AGENT_RUNNER_AGENT_DIR`: Agent code directory (default: ./agent)
    /// - `AGENT_RUNNER_ENTRYPOINT`: Agent entrypoint (default: main.run)
    /// - `AGENT_RUNNER_SETUP_SCRIPT`: Benchmark setup script
    /// - `AGENT_RUNNER_REMOTE_USER`: Remote account (default: agent)
    /// - `AGENT_RUNNER_NETWORK_POLICY`: Provider network policy
    /// - `AGENT_RUNNER_COLLECT_ARTIFACTS`: Copy workspaces back (default: true)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AGENT_RUNNER_LOG_DIR") {
            config.log_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_RUN_ID") {
            config.run_id = val;
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_BENCHMARK") {
            config.benchmark_name = val;
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_MAX_CONCURRENT") {
            config.max_concurrent = parse_env_value(&val, "AGENT_RUNNER_MAX_CONCURRENT")?;
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENT_RUNNER_TIMEOUT_SECS")?;
            config.timeout = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_POLL_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "AGENT_RUNNER_POLL_INTERVAL_SECS")?;
            config.poll_interval = Duration::from_secs(secs);
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_AGENT_DIR") {
            config.agent_dir = PathBuf::from(val);
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_ENTRYPOINT") {
            config.entrypoint = val;
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_SETUP_SCRIPT") {
            config.setup_script = Some(PathBuf::from(val));
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_REMOTE_USER") {
            config.remote_user = val;
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_NETWORK_POLICY") {
            config.network_policy = Some(val);
        }
        if let Ok(val) = std::env::var("AGENT_RUNNER_COLLECT_ARTIFACTS") {
            config.collect_artifacts = parse_env_bool(&val, "AGENT_RUNNER_COLLECT_ARTIFACTS")?;
        }

        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_concurrent must be greater than 0".to_string(),
            ));
        }

        if self.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "timeout must be greater than 0".to_string(),
            ));
        }

        if self.poll_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "poll_interval must be greater than 0".to_string(),
            ));
        }

        if self.run_id.trim().is_empty() || self.run_id.contains(['/', '\\']) {
            return Err(ConfigError::ValidationFailed(format!(
                "run_id '{}' must be non-empty and must not contain path separators",
                self.run_id
            )));
        }

        if self.benchmark_name.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "benchmark_name cannot be empty".to_string(),
            ));
        }

        if self.entrypoint.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "entrypoint cannot be empty".to_string(),
            ));
        }

        if self.remote_user.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "remote_user cannot be empty".to_string(),
            ));
        }

        if !self.agent_args.is_object() {
            return Err(ConfigError::ValidationFailed(
                "agent_args must be a JSON object".to_string(),
            ));
        }

        Ok(())
    }

    /// Path of this run's submission log.
    pub fn submissions_path(&self) -> PathBuf {
        self.log_dir
            .join(format!("{}_RAW_SUBMISSIONS.jsonl", self.run_id))
    }

    /// Directory receiving per-task and combined agent traces.
    pub fn agent_logs_dir(&self) -> PathBuf {
        self.log_dir.join("agent_logs")
    }

    /// Directory receiving a task's copied-back workspace. Always a direct
    /// child of the log directory.
    pub fn artifact_dir(&self, task_id: &str) -> PathBuf {
        self.log_dir.join(task_path_component(task_id))
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = dir.into();
        self
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    pub fn with_benchmark(mut self, name: impl Into<String>) -> Self {
        self.benchmark_name = name.into();
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_agent_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.agent_dir = dir.into();
        self
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub fn with_agent_args(mut self, args: Value) -> Self {
        self.agent_args = args;
        self
    }

    pub fn with_setup_script(mut self, path: impl Into<PathBuf>) -> Self {
        self.setup_script = Some(path.into());
        self
    }

    pub fn with_remote_user(mut self, user: impl Into<String>) -> Self {
        self.remote_user = user.into();
        self
    }

    pub fn with_network_policy(mut self, policy: impl Into<String>) -> Self {
        self.network_policy = Some(policy.into());
        self
    }

    pub fn with_collect_artifacts(mut self, collect: bool) -> Self {
        self.collect_artifacts = collect;
        self
    }
}

/// Parses an environment variable value into the requested type.
pub(crate) fn parse_env_value<T: FromStr>(value: &str, key: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Parses a boolean environment variable (`true/false`, `1/0`, `yes/no`).
pub(crate) fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got '{}'", other),
        }),
    }
}
