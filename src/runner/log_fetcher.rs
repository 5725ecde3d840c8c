//! Incremental retrieval of remote agent traces.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use tokio::sync::Mutex;
use tracing::debug;

use super::best_effort::{attempt, FailureStage};
use super::environment::{EnvironmentHandle, RemoteProvider};
use super::task::task_path_component;
use crate::error::ProviderError;
use crate::metrics::RunnerMetrics;

/// Name of the log collecting every task's trace snapshots.
pub const COMBINED_LOG_FILE: &str = "combined_logs.log";

/// Pulls agent traces into `{log_dir}/agent_logs/`.
///
/// Shared by every driver of a batch. Fetching never fails the caller.
#[derive(Debug)]
pub struct LogFetcher {
    dir: PathBuf,
    metrics: Arc<RunnerMetrics>,
    combined_lock: Mutex<()>,
}

impl LogFetcher {
    pub fn new(dir: impl Into<PathBuf>, metrics: Arc<RunnerMetrics>) -> Self {
        Self {
            dir: dir.into(),
            metrics,
            combined_lock: Mutex::new(()),
        }
    }

    /// Per-task trace file, overwritten on every successful fetch.
    pub fn task_log_path(&self, task_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}_log.log", task_path_component(task_id)))
    }

    pub fn combined_log_path(&self) -> PathBuf {
        self.dir.join(COMBINED_LOG_FILE)
    }

    /// Fetches the current trace and stores it. Returns whether a trace was
    /// written; absence of output is not an error.
    pub async fn fetch(
        &self,
        provider: &dyn RemoteProvider,
        env: &EnvironmentHandle,
        task_id: &str,
    ) -> bool {
        attempt(
            FailureStage::LogFetch,
            env.name(),
            &self.metrics,
            self.fetch_and_store(provider, env, task_id),
        )
        .await
        .unwrap_or(false)
    }

    async fn fetch_and_store(
        &self,
        provider: &dyn RemoteProvider,
        env: &EnvironmentHandle,
        task_id: &str,
    ) -> Result<bool, ProviderError> {
        match provider.fetch_trace(env).await? {
            Some(trace) if !trace.is_empty() => {
                self.store(task_id, trace).await?;
                Ok(true)
            }
            _ => {
                debug!(task_id = %task_id, environment = %env.name(), "No agent trace yet");
                Ok(false)
            }
        }
    }

    /// Writes a trace snapshot: overwrites the task file and appends a
    /// timestamped section to the combined log.
    pub async fn store(&self, task_id: &str, trace: String) -> Result<(), ProviderError> {
        let dir = self.dir.clone();
        let task_path = self.task_log_path(task_id);
        let combined_path = self.combined_log_path();
        let header = format!(
            "\n=== {} @ {} ===\n",
            task_id,
            Local::now().format("%Y-%m-%d %H:%M:%S")
        );

        let _guard = self.combined_lock.lock().await;
        tokio::task::spawn_blocking(move || {
            write_snapshot(&dir, &task_path, &combined_path, &header, &trace)
        })
        .await
        .map_err(|e| ProviderError::Io(std::io::Error::other(e)))??;

        debug!(task_id = %task_id, "Stored agent trace");
        Ok(())
    }
}

fn write_snapshot(
    dir: &Path,
    task_path: &Path,
    combined_path: &Path,
    header: &str,
    trace: &str,
) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    fs::write(task_path, trace)?;

    let mut combined = OpenOptions::new()
        .create(true)
        .append(true)
        .open(combined_path)?;
    let mut section = String::with_capacity(header.len() + trace.len() + 1);
    section.push_str(header);
    section.push_str(trace);
    section.push('\n');
    combined.write_all(section.as_bytes())?;
    Ok(())
}
