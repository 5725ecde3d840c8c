//! Agent runner for benchmark evaluation.
//!
//! Runs an external agent against benchmark tasks, one ephemeral remote
//! environment per task, and records every outcome durably.
//!
//! # Architecture
//!
//! ```text
//! Task → TaskDriver → RemoteProvider (create → copy → launch → poll → collect → delete)
//!                   → SubmissionLog (one fsync'd line per outcome)
//!                   → LogFetcher (agent traces under agent_logs/)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use agent_vm_runner::runner::{DockerProvider, DockerProviderConfig, RunnerConfig, TaskDriver};
//!
//! let provider = Arc::new(DockerProvider::new(DockerProviderConfig::default()));
//! let config = RunnerConfig::new().with_benchmark("usaco").with_max_concurrent(4);
//! let driver = TaskDriver::new(provider, Arc::new(config), Arc::new(RunnerMetrics::new()?));
//! let outcome = driver.process(&task).await;
//! ```

pub mod best_effort;
pub mod config;
pub mod environment;
pub mod executor;
pub mod log_fetcher;
pub mod result;
pub mod sandbox;
pub mod staging;
pub mod submissions;
pub mod task;

pub use best_effort::FailureStage;
pub use config::RunnerConfig;
pub use environment::{
    environment_name, EnvironmentHandle, EnvironmentSpec, EnvironmentState, LaunchRequest,
    RemoteProvider,
};
pub use executor::TaskDriver;
pub use log_fetcher::LogFetcher;
pub use result::{SubmissionRecord, TaskOutcome};
pub use sandbox::{DockerProvider, DockerProviderConfig};
pub use staging::StagingArea;
pub use submissions::SubmissionLog;
pub use task::{task_path_component, Task};
