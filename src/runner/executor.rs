//! Task lifecycle driver - carries one task from input to recorded outcome.

use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::best_effort::{attempt, FailureStage};
use super::config::RunnerConfig;
use super::environment::{
    environment_name, EnvironmentHandle, EnvironmentSpec, LaunchRequest, RemoteProvider,
};
use super::log_fetcher::LogFetcher;
use super::result::{SubmissionRecord, TaskOutcome};
use super::staging::StagingArea;
use super::submissions::SubmissionLog;
use super::task::Task;
use crate::error::{ProviderError, TaskError};
use crate::metrics::RunnerMetrics;

/// Drives a task through create → stage → launch → poll → collect →
/// record → delete.
///
/// `process` never fails: every error inside a task's lifecycle becomes an
/// `Error` outcome, and every outcome is appended to the submission log
/// before the environment is deleted and the call returns.
pub struct TaskDriver {
    provider: Arc<dyn RemoteProvider>,
    config: Arc<RunnerConfig>,
    submissions: Arc<SubmissionLog>,
    log_fetcher: Arc<LogFetcher>,
    metrics: Arc<RunnerMetrics>,
}

impl TaskDriver {
    /// Creates a driver writing to the config's submission log and agent log
    /// directory.
    pub fn new(
        provider: Arc<dyn RemoteProvider>,
        config: Arc<RunnerConfig>,
        metrics: Arc<RunnerMetrics>,
    ) -> Self {
        let submissions = Arc::new(SubmissionLog::new(config.submissions_path()));
        let log_fetcher = Arc::new(LogFetcher::new(
            config.agent_logs_dir(),
            Arc::clone(&metrics),
        ));
        Self {
            provider,
            config,
            submissions,
            log_fetcher,
            metrics,
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn submissions(&self) -> &SubmissionLog {
        &self.submissions
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Runs one task to a durably recorded outcome.
    pub async fn process(&self, task: &Task) -> TaskOutcome {
        let started = Instant::now();
        let name = environment_name(&self.config.benchmark_name);
        let mut env: Option<EnvironmentHandle> = None;

        info!(
            task_id = %task.id,
            environment = %name,
            gpu = task.gpu,
            "Starting task"
        );

        let outcome = match AssertUnwindSafe(self.execute(task, &name, &mut env))
            .catch_unwind()
            .await
        {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(e)) => {
                error!(task_id = %task.id, environment = %name, error = %e, "Task failed");
                TaskOutcome::error(e)
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(task_id = %task.id, environment = %name, panic = %message, "Task panicked");
                TaskOutcome::error(format!("task panicked: {}", message))
            }
        };

        self.record(&task.id, &outcome).await;
        self.cleanup(&name, env).await;

        let elapsed = started.elapsed();
        self.metrics.record_outcome(&outcome, elapsed);
        info!(
            task_id = %task.id,
            outcome = outcome.label(),
            elapsed_secs = elapsed.as_secs(),
            "Task finished"
        );
        outcome
    }

    /// Appends an outcome to the submission log. A failed write is logged;
    /// the outcome is still returned to the scheduler.
    pub(crate) async fn record(&self, task_id: &str, outcome: &TaskOutcome) {
        let record = SubmissionRecord::new(task_id, outcome.clone());
        if let Err(e) = self.submissions.append(&record).await {
            error!(
                task_id = %task_id,
                path = %self.submissions.path().display(),
                error = %e,
                "Failed to record submission"
            );
        }
    }

    async fn execute(
        &self,
        task: &Task,
        name: &str,
        env: &mut Option<EnvironmentHandle>,
    ) -> Result<TaskOutcome, TaskError> {
        let spec = EnvironmentSpec {
            name: name.to_string(),
            user: self.config.remote_user.clone(),
            network_policy: self.config.network_policy.clone(),
            gpu: task.gpu,
        };

        info!(
            environment = %name,
            provider = self.provider.name(),
            "Creating {}environment",
            if task.gpu { "GPU " } else { "" }
        );
        let created = self.provider.create_environment(&spec).await?;
        self.metrics.environment_created();
        let env = env.insert(created);

        self.stage_and_push(task, env).await?;

        let request = LaunchRequest {
            entrypoint: self.config.entrypoint.clone(),
            task_id: task.id.clone(),
            input: task.input.clone(),
            agent_args: self.config.agent_args.clone(),
            run_id: self.config.run_id.clone(),
        };
        self.provider.launch(env, &request).await?;
        env.mark_running(&task.id);
        debug!(task_id = %task.id, environment = %name, "Agent launched");

        let outcome = self.poll(task, env).await;

        if self.config.collect_artifacts {
            self.collect_artifacts(task, env).await;
        }

        Ok(outcome)
    }

    async fn stage_and_push(&self, task: &Task, env: &EnvironmentHandle) -> Result<(), TaskError> {
        let staged_task = task.clone();
        let agent_args = self.config.agent_args.clone();
        let setup_script = self.config.setup_script.clone();

        let staging = tokio::task::spawn_blocking(move || {
            StagingArea::prepare(&staged_task, &agent_args, setup_script.as_deref())
        })
        .await
        .map_err(|e| TaskError::Join(e.to_string()))??;

        for _ in 0..staging.skipped_files() {
            self.metrics.record_nonfatal(FailureStage::FileStaging);
        }

        info!(environment = %env.name(), "Copying files to environment");
        self.provider.copy_to(env, staging.path()).await?;
        self.provider.copy_to(env, &self.config.agent_dir).await?;

        tokio::task::spawn_blocking(move || drop(staging))
            .await
            .map_err(|e| TaskError::Join(e.to_string()))?;
        Ok(())
    }

    /// Polls until the agent reports an outcome or the timeout elapses.
    async fn poll(&self, task: &Task, env: &EnvironmentHandle) -> TaskOutcome {
        let timeout = self.config.timeout;
        let started = Instant::now();

        while started.elapsed() < timeout {
            self.log_fetcher
                .fetch(self.provider.as_ref(), env, &task.id)
                .await;

            debug!(environment = %env.name(), "Checking task completion");
            let checked = attempt(
                FailureStage::CompletionCheck,
                env.name(),
                &self.metrics,
                self.provider.check_completion(env),
            )
            .await;

            if let Some(Some(outcome)) = checked {
                info!(task_id = %task.id, environment = %env.name(), "Task completed");
                return outcome;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }

        warn!(
            task_id = %task.id,
            timeout_secs = timeout.as_secs(),
            "Task timed out"
        );
        TaskOutcome::timeout(timeout)
    }

    async fn collect_artifacts(&self, task: &Task, env: &EnvironmentHandle) {
        let dest = self.config.artifact_dir(&task.id);
        info!(environment = %env.name(), dest = %dest.display(), "Copying results from environment");

        let copied = attempt(
            FailureStage::ArtifactCopy,
            env.name(),
            &self.metrics,
            self.copy_back(env, &dest),
        )
        .await;
        if copied.is_none() {
            warn!(
                task_id = %task.id,
                "Result is kept but workspace files could not be copied"
            );
        }
    }

    async fn copy_back(&self, env: &EnvironmentHandle, dest: &Path) -> Result<(), ProviderError> {
        tokio::fs::create_dir_all(dest).await?;
        self.provider.copy_from(env, dest).await
    }

    /// Deletes the environment. Runs on every path, including when
    /// provisioning failed and no handle exists.
    ///
    /// The active-environments gauge only drops once the provider confirms
    /// the delete.
    async fn cleanup(&self, name: &str, env: Option<EnvironmentHandle>) {
        info!(environment = %name, "Deleting environment");
        let deleted = attempt(
            FailureStage::Cleanup,
            name,
            &self.metrics,
            self.provider.delete_environment(name),
        )
        .await
        .is_some();

        if let Some(mut env) = env {
            env.mark_terminated();
            if deleted {
                self.metrics.environment_released();
            } else {
                warn!(environment = %name, "Environment may still be running");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
