//! Docker-backed remote environments.
//!
//! Each environment is a detached container kept alive with `sleep`, with
//! the workspace at `{workdir_root}/{user}` (`/home/agent` by default).
//! Files move with `docker cp`, the agent is started with `docker exec -d`,
//! and the container is removed with `docker rm -f`.
//!
//! The launched command reports its result by writing `output.json` into
//! the workspace as exactly `{"<task_id>": <value>}`. Any other document is
//! rejected. Its stdout and stderr land in `agent_trace.log`, and the launch
//! shell writes the command's exit status to `agent_exit_status` once it
//! returns. A finished command without a valid `output.json` is an error
//! outcome.

use std::path::Path;
use std::process::Output;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;
use tracing::{debug, info};

use super::config::{parse_env_bool, parse_env_value};
use super::environment::{EnvironmentHandle, EnvironmentSpec, LaunchRequest, RemoteProvider};
use super::result::TaskOutcome;
use crate::error::{ConfigError, ProviderError};

/// File the launched agent writes its result to.
pub const OUTPUT_FILE: &str = "output.json";

/// File receiving the agent's stdout and stderr.
pub const TRACE_FILE: &str = "agent_trace.log";

/// File the launch shell writes the agent's exit status to.
pub const EXIT_STATUS_FILE: &str = "agent_exit_status";

/// Label put on every container so leftovers can be found and removed.
pub const CONTAINER_LABEL: &str = "agent-vm-runner=1";

/// Configuration for the Docker provider.
#[derive(Debug, Clone)]
pub struct DockerProviderConfig {
    /// Docker CLI binary.
    pub docker_bin: String,
    /// Image for CPU tasks.
    pub image: String,
    /// Image for GPU tasks.
    pub gpu_image: String,
    /// Memory limit in MB (0 for no limit).
    pub memory_limit_mb: u64,
    /// CPU limit in cores (0.0 for no limit).
    pub cpu_limit: f64,
    /// Shell command that starts the agent inside the workspace.
    pub launch_command: String,
    /// Parent of per-user workspaces inside the container.
    pub workdir_root: String,
    /// Run the container as the environment's user. The image must have it.
    pub run_as_user: bool,
}

impl Default for DockerProviderConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            image: "python:3.11-slim".to_string(),
            gpu_image: "nvidia/cuda:12.2.0-runtime-ubuntu22.04".to_string(),
            memory_limit_mb: 4096,
            cpu_limit: 2.0,
            launch_command: "python3 -u run_agent.py".to_string(),
            workdir_root: "/home".to_string(),
            run_as_user: false,
        }
    }
}

impl DockerProviderConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `AGENT_DOCKER_BIN`: Docker CLI binary (default: docker)
    /// - `AGENT_DOCKER_IMAGE`: CPU image (default: python:3.11-slim)
    /// - `AGENT_DOCKER_GPU_IMAGE`: GPU image
    /// - `AGENT_DOCKER_MEMORY_MB`: Memory limit in MB (default: 4096)
    /// - `AGENT_DOCKER_CPUS`: CPU limit (default: 2.0)
    /// - `AGENT_DOCKER_LAUNCH_COMMAND`: Agent launch command
    /// - `AGENT_DOCKER_WORKDIR_ROOT`: Parent of workspaces (default: /home)
    /// - `AGENT_DOCKER_RUN_AS_USER`: Pass `--user` to `docker run` (default: false)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("AGENT_DOCKER_BIN") {
            config.docker_bin = val;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_IMAGE") {
            config.image = val;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_GPU_IMAGE") {
            config.gpu_image = val;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_MEMORY_MB") {
            config.memory_limit_mb = parse_env_value(&val, "AGENT_DOCKER_MEMORY_MB")?;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_CPUS") {
            config.cpu_limit = parse_env_value(&val, "AGENT_DOCKER_CPUS")?;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_LAUNCH_COMMAND") {
            config.launch_command = val;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_WORKDIR_ROOT") {
            config.workdir_root = val;
        }
        if let Ok(val) = std::env::var("AGENT_DOCKER_RUN_AS_USER") {
            config.run_as_user = parse_env_bool(&val, "AGENT_DOCKER_RUN_AS_USER")?;
        }

        Ok(config)
    }

    /// Validates the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.docker_bin.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "docker_bin cannot be empty".to_string(),
            ));
        }
        if self.image.trim().is_empty() || self.gpu_image.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "image and gpu_image cannot be empty".to_string(),
            ));
        }
        if self.cpu_limit < 0.0 {
            return Err(ConfigError::ValidationFailed(
                "cpu_limit cannot be negative".to_string(),
            ));
        }
        if !self.workdir_root.starts_with('/') {
            return Err(ConfigError::ValidationFailed(
                "workdir_root must be an absolute path".to_string(),
            ));
        }
        if self.launch_command.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "launch_command cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_gpu_image(mut self, image: impl Into<String>) -> Self {
        self.gpu_image = image.into();
        self
    }

    pub fn with_memory_mb(mut self, mb: u64) -> Self {
        self.memory_limit_mb = mb;
        self
    }

    pub fn with_cpu_limit(mut self, cores: f64) -> Self {
        self.cpu_limit = cores;
        self
    }

    pub fn with_launch_command(mut self, command: impl Into<String>) -> Self {
        self.launch_command = command.into();
        self
    }

    pub fn with_workdir_root(mut self, root: impl Into<String>) -> Self {
        self.workdir_root = root.into();
        self
    }

    pub fn with_run_as_user(mut self, enabled: bool) -> Self {
        self.run_as_user = enabled;
        self
    }
}

/// Remote provider backed by local or remote Docker daemons.
#[derive(Debug, Clone)]
pub struct DockerProvider {
    config: DockerProviderConfig,
}

impl DockerProvider {
    pub fn new(config: DockerProviderConfig) -> Self {
        Self { config }
    }

    /// Checks that the Docker daemon answers. Run once before a batch.
    pub async fn check_available(&self) -> Result<(), ProviderError> {
        let output = self
            .docker(&["version", "--format", "{{.Server.Version}}"])
            .await
            .map_err(|e| ProviderError::Unavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(ProviderError::Unavailable(stderr_of(&output)));
        }
        info!(
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Docker daemon available"
        );
        Ok(())
    }

    /// Workspace directory inside an environment.
    pub fn workspace(&self, user: &str) -> String {
        format!("{}/{}", self.config.workdir_root.trim_end_matches('/'), user)
    }

    /// Arguments for `docker run` creating an environment.
    pub fn run_args(&self, spec: &EnvironmentSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            spec.name.clone(),
            "--label".to_string(),
            CONTAINER_LABEL.to_string(),
        ];

        if self.config.memory_limit_mb > 0 {
            args.push(format!("--memory={}m", self.config.memory_limit_mb));
        }
        if self.config.cpu_limit > 0.0 {
            args.push(format!("--cpus={}", self.config.cpu_limit));
        }
        if let Some(network) = &spec.network_policy {
            args.push(format!("--network={}", network));
        }
        if spec.gpu {
            args.push("--gpus".to_string());
            args.push("all".to_string());
        }
        if self.config.run_as_user {
            args.push(format!("--user={}", spec.user));
        }

        args.push("-w".to_string());
        args.push(self.workspace(&spec.user));

        let image = if spec.gpu {
            &self.config.gpu_image
        } else {
            &self.config.image
        };
        args.push(image.clone());
        args.extend(["sleep".to_string(), "infinity".to_string()]);
        args
    }

    /// Arguments for `docker exec -d` starting the agent.
    pub fn launch_args(&self, env: &EnvironmentHandle, request: &LaunchRequest) -> Vec<String> {
        let script = format!(
            "{{ if [ -x ./setup_script.sh ]; then ./setup_script.sh; fi; {cmd}; \
             echo $? > {status}.tmp; mv {status}.tmp {status}; }} > {trace} 2>&1",
            cmd = self.config.launch_command,
            status = EXIT_STATUS_FILE,
            trace = TRACE_FILE
        );
        let agent_args = serde_json::to_string(&request.agent_args).unwrap_or_else(|_| "{}".to_string());

        vec![
            "exec".to_string(),
            "-d".to_string(),
            "-w".to_string(),
            self.workspace(env.user()),
            "-e".to_string(),
            format!("AGENT_ENTRYPOINT={}", request.entrypoint),
            "-e".to_string(),
            format!("TASK_ID={}", request.task_id),
            "-e".to_string(),
            format!("RUN_ID={}", request.run_id),
            "-e".to_string(),
            format!("AGENT_ARGS={}", agent_args),
            env.name().to_string(),
            "sh".to_string(),
            "-c".to_string(),
            script,
        ]
    }

    async fn docker<S: AsRef<std::ffi::OsStr>>(&self, args: &[S]) -> std::io::Result<Output> {
        Command::new(&self.config.docker_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
    }

    /// Runs a shell command inside the workspace and returns its stdout.
    async fn exec_in_workspace(
        &self,
        env: &EnvironmentHandle,
        script: &str,
    ) -> Result<String, String> {
        let workspace = self.workspace(env.user());
        let output = self
            .docker(&["exec", "-w", &workspace, env.name(), "sh", "-c", script])
            .await
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(stderr_of(&output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl RemoteProvider for DockerProvider {
    fn name(&self) -> &str {
        "docker"
    }

    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError> {
        let provisioning = |reason: String| ProviderError::Provisioning {
            name: spec.name.clone(),
            reason,
        };

        let output = self
            .docker(&self.run_args(spec))
            .await
            .map_err(|e| provisioning(e.to_string()))?;
        if !output.status.success() {
            return Err(provisioning(stderr_of(&output)));
        }

        let workspace = self.workspace(&spec.user);
        let output = self
            .docker(&["exec", &spec.name, "mkdir", "-p", &workspace])
            .await
            .map_err(|e| provisioning(e.to_string()))?;
        if !output.status.success() {
            return Err(provisioning(stderr_of(&output)));
        }

        debug!(environment = %spec.name, gpu = spec.gpu, "Container started");
        Ok(EnvironmentHandle::new(spec))
    }

    async fn copy_to(
        &self,
        env: &EnvironmentHandle,
        local_dir: &Path,
    ) -> Result<(), ProviderError> {
        let source = format!("{}/.", local_dir.display());
        let target = format!("{}:{}", env.name(), self.workspace(env.user()));
        let output = self
            .docker(&["cp", &source, &target])
            .await?;
        if !output.status.success() {
            return Err(ProviderError::Transfer {
                name: env.name().to_string(),
                reason: stderr_of(&output),
            });
        }
        Ok(())
    }

    async fn launch(
        &self,
        env: &EnvironmentHandle,
        request: &LaunchRequest,
    ) -> Result<(), ProviderError> {
        let output = self
            .docker(&self.launch_args(env, request))
            .await
            .map_err(|e| ProviderError::Launch {
                name: env.name().to_string(),
                reason: e.to_string(),
            })?;
        if !output.status.success() {
            return Err(ProviderError::Launch {
                name: env.name().to_string(),
                reason: stderr_of(&output),
            });
        }
        Ok(())
    }

    async fn check_completion(
        &self,
        env: &EnvironmentHandle,
    ) -> Result<Option<TaskOutcome>, ProviderError> {
        let check_failed = |reason: String| ProviderError::CompletionCheck {
            name: env.name().to_string(),
            reason,
        };
        let task_id = env
            .task_id()
            .ok_or_else(|| check_failed("no agent has been launched".to_string()))?;

        // Exit status first: once it exists, output.json is final.
        let status = self
            .exec_in_workspace(env, &cat_if_present(EXIT_STATUS_FILE))
            .await
            .map_err(check_failed)?;
        let output = self
            .exec_in_workspace(env, &cat_if_present(OUTPUT_FILE))
            .await
            .map_err(check_failed)?;

        parse_completion(task_id, &status, &output).map_err(check_failed)
    }

    async fn fetch_trace(&self, env: &EnvironmentHandle) -> Result<Option<String>, ProviderError> {
        let text = self
            .exec_in_workspace(env, &cat_if_present(TRACE_FILE))
            .await
            .map_err(|reason| ProviderError::TraceFetch {
                name: env.name().to_string(),
                reason,
            })?;
        Ok(if text.is_empty() { None } else { Some(text) })
    }

    async fn copy_from(
        &self,
        env: &EnvironmentHandle,
        local_dir: &Path,
    ) -> Result<(), ProviderError> {
        let source = format!("{}:{}/.", env.name(), self.workspace(env.user()));
        let target = local_dir.display().to_string();
        let output = self.docker(&["cp", &source, &target]).await?;
        if !output.status.success() {
            return Err(ProviderError::ArtifactCopy {
                name: env.name().to_string(),
                reason: stderr_of(&output),
            });
        }
        Ok(())
    }

    async fn delete_environment(&self, name: &str) -> Result<(), ProviderError> {
        let output = self.docker(&["rm", "-f", name]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = stderr_of(&output);
        if stderr.contains("No such container") {
            debug!(environment = %name, "Container was never created");
            return Ok(());
        }
        Err(ProviderError::Cleanup {
            name: name.to_string(),
            reason: stderr,
        })
    }
}

/// Interprets the agent's exit status and `output.json`.
///
/// `output.json` must be an object whose only key is the task id; its value
/// is the result. An empty output with no exit status means the agent is
/// still running. An empty output after the agent exited is an error
/// outcome. Any other output document is rejected.
pub fn parse_completion(
    task_id: &str,
    exit_status: &str,
    output: &str,
) -> Result<Option<TaskOutcome>, String> {
    let output = output.trim();
    if !output.is_empty() {
        return parse_output(task_id, output).map(Some);
    }

    let exit_status = exit_status.trim();
    if exit_status.is_empty() {
        return Ok(None);
    }
    let code: i32 = exit_status
        .parse()
        .map_err(|_| format!("invalid {}: '{}'", EXIT_STATUS_FILE, exit_status))?;
    let message = if code == 0 {
        format!("agent exited without writing {}", OUTPUT_FILE)
    } else {
        format!("agent exited with status {} without writing {}", code, OUTPUT_FILE)
    };
    Ok(Some(TaskOutcome::error(message)))
}

fn parse_output(task_id: &str, output: &str) -> Result<TaskOutcome, String> {
    let value: Value =
        serde_json::from_str(output).map_err(|e| format!("invalid {}: {}", OUTPUT_FILE, e))?;

    match value {
        Value::Object(mut map) if map.len() == 1 => map
            .remove(task_id)
            .map(TaskOutcome::success)
            .ok_or_else(|| format!("{} is not keyed by task id '{}'", OUTPUT_FILE, task_id)),
        _ => Err(format!(
            "{} must be a single-entry object keyed by task id '{}'",
            OUTPUT_FILE, task_id
        )),
    }
}

fn cat_if_present(file: &str) -> String {
    format!("if [ -f {0} ]; then cat {0}; fi", file)
}

fn stderr_of(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stderr
    }
}
