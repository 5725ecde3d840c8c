//! Remote environment contract.
//!
//! A remote environment is an ephemeral, isolated machine provisioned for
//! exactly one task. The runner only talks to it through [`RemoteProvider`];
//! how a provider creates machines or moves files is its own business.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::result::TaskOutcome;
use crate::error::ProviderError;

/// Longest environment name accepted by providers.
pub const MAX_ENVIRONMENT_NAME_LEN: usize = 32;

/// Hex characters of randomness kept at the end of every environment name.
const RANDOM_SUFFIX_LEN: usize = 12;

/// Lifecycle state of a remote environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Provisioning,
    Ready,
    Running,
    Terminated,
}

impl std::fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EnvironmentState::Provisioning => write!(f, "provisioning"),
            EnvironmentState::Ready => write!(f, "ready"),
            EnvironmentState::Running => write!(f, "running"),
            EnvironmentState::Terminated => write!(f, "terminated"),
        }
    }
}

/// What to provision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentSpec {
    /// Provider-safe unique name, see [`environment_name`].
    pub name: String,
    /// Account the agent runs as on the remote side.
    pub user: String,
    /// Provider-specific network policy (security group, docker network).
    pub network_policy: Option<String>,
    /// Whether a GPU-capable configuration is required.
    pub gpu: bool,
}

/// Handle to one provisioned environment, owned by a single driver.
#[derive(Debug, Clone)]
pub struct EnvironmentHandle {
    name: String,
    user: String,
    gpu: bool,
    state: EnvironmentState,
    task_id: Option<String>,
}

impl EnvironmentHandle {
    /// Creates a handle for a freshly provisioned environment.
    pub fn new(spec: &EnvironmentSpec) -> Self {
        Self {
            name: spec.name.clone(),
            user: spec.user.clone(),
            gpu: spec.gpu,
            state: EnvironmentState::Ready,
            task_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn gpu(&self) -> bool {
        self.gpu
    }

    pub fn state(&self) -> EnvironmentState {
        self.state
    }

    /// Task the agent was launched for, once running.
    pub fn task_id(&self) -> Option<&str> {
        self.task_id.as_deref()
    }

    pub fn mark_running(&mut self, task_id: impl Into<String>) {
        self.state = EnvironmentState::Running;
        self.task_id = Some(task_id.into());
    }

    pub fn mark_terminated(&mut self) {
        self.state = EnvironmentState::Terminated;
    }
}

/// Everything the remote side needs to start the agent.
#[derive(Debug, Clone, Serialize)]
pub struct LaunchRequest {
    /// Agent entrypoint, e.g. `main.run`.
    pub entrypoint: String,
    pub task_id: String,
    pub input: Value,
    pub agent_args: Value,
    pub run_id: String,
}

/// Capability surface of a remote environment provider.
///
/// Every method is async; implementations that wrap blocking SDKs must
/// offload that work so the scheduler is never stalled.
#[async_trait]
pub trait RemoteProvider: Send + Sync {
    /// Short provider name for logs.
    fn name(&self) -> &str;

    /// Provisions an environment. May leave partial resources behind on
    /// failure; callers always follow up with [`Self::delete_environment`].
    async fn create_environment(
        &self,
        spec: &EnvironmentSpec,
    ) -> Result<EnvironmentHandle, ProviderError>;

    /// Copies the contents of a local directory into the remote workspace.
    async fn copy_to(&self, env: &EnvironmentHandle, local_dir: &Path)
        -> Result<(), ProviderError>;

    /// Starts the agent and returns without waiting for it.
    async fn launch(
        &self,
        env: &EnvironmentHandle,
        request: &LaunchRequest,
    ) -> Result<(), ProviderError>;

    /// Returns the task's outcome once the remote agent has finished.
    async fn check_completion(
        &self,
        env: &EnvironmentHandle,
    ) -> Result<Option<TaskOutcome>, ProviderError>;

    /// Returns the agent's trace so far, or `None` if there is nothing yet.
    async fn fetch_trace(&self, env: &EnvironmentHandle) -> Result<Option<String>, ProviderError>;

    /// Copies the remote workspace into a local directory.
    async fn copy_from(
        &self,
        env: &EnvironmentHandle,
        local_dir: &Path,
    ) -> Result<(), ProviderError>;

    /// Destroys the environment by name. Must tolerate partially created
    /// environments.
    async fn delete_environment(&self, name: &str) -> Result<(), ProviderError>;
}

/// Derives a fresh environment name for a benchmark.
///
/// The name is `agent-{benchmark}-{random}` restricted to lowercase
/// alphanumerics and `-`, at most [`MAX_ENVIRONMENT_NAME_LEN`] characters.
/// The benchmark part is shortened rather than the random part, so long
/// benchmark names never eat into uniqueness.
pub fn environment_name(benchmark: &str) -> String {
    let token = Uuid::new_v4().simple().to_string();
    let token = &token[..RANDOM_SUFFIX_LEN];

    let mut prefix: String = format!("agent-{}", benchmark)
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .collect();
    prefix.truncate(MAX_ENVIRONMENT_NAME_LEN - RANDOM_SUFFIX_LEN - 1);
    let prefix = prefix.trim_end_matches('-');

    format!("{}-{}", prefix, token)
}
