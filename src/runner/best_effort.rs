//! Attempt-and-log wrapper for steps whose failure must not end a task.

use std::fmt::Display;
use std::future::Future;

use tracing::warn;

use crate::metrics::RunnerMetrics;

/// Lifecycle steps that are allowed to fail without ending a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureStage {
    /// Copying one declared auxiliary file into the staging area.
    FileStaging,
    /// Pulling the agent trace.
    LogFetch,
    /// Asking the environment whether the agent has finished.
    CompletionCheck,
    /// Copying the remote workspace back after a result.
    ArtifactCopy,
    /// Deleting the environment.
    Cleanup,
}

impl FailureStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureStage::FileStaging => "file_staging",
            FailureStage::LogFetch => "log_fetch",
            FailureStage::CompletionCheck => "completion_check",
            FailureStage::ArtifactCopy => "artifact_copy",
            FailureStage::Cleanup => "cleanup",
        }
    }
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs `operation`, logging and counting any error instead of returning it.
///
/// `subject` names what the operation acted on (usually the environment).
pub async fn attempt<T, E, F>(
    stage: FailureStage,
    subject: &str,
    metrics: &RunnerMetrics,
    operation: F,
) -> Option<T>
where
    F: Future<Output = Result<T, E>>,
    E: Display,
{
    match operation.await {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(stage = %stage, subject = %subject, error = %e, "Non-fatal failure");
            metrics.record_nonfatal(stage);
            None
        }
    }
}
