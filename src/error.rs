//! Error types for agent-vm-runner operations.
//!
//! Defines error types for each subsystem:
//! - Remote environment provider calls
//! - Input staging before a push
//! - Submission log persistence
//! - Runner and provider configuration
//! - The per-task lifecycle as a whole

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised by a remote environment provider.
///
/// Variants follow the lifecycle step that failed. Only provisioning,
/// transfer and launch failures end a task; the others are recorded and
/// the task carries on.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Provisioning failed for environment '{name}': {reason}")]
    Provisioning { name: String, reason: String },

    #[error("Transfer to or from environment '{name}' failed: {reason}")]
    Transfer { name: String, reason: String },

    #[error("Launch failed on environment '{name}': {reason}")]
    Launch { name: String, reason: String },

    #[error("Completion check failed on environment '{name}': {reason}")]
    CompletionCheck { name: String, reason: String },

    #[error("Trace fetch failed on environment '{name}': {reason}")]
    TraceFetch { name: String, reason: String },

    #[error("Artifact copy from environment '{name}' failed: {reason}")]
    ArtifactCopy { name: String, reason: String },

    #[error("Cleanup of environment '{name}' failed: {reason}")]
    Cleanup { name: String, reason: String },

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur while building a task's staging area.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("Failed to create staging directory: {0}")]
    DirectoryCreationFailed(String),

    #[error("Setup script '{path}' could not be staged: {reason}")]
    SetupScript { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while writing or reading the submission log.
#[derive(Debug, Error)]
pub enum SubmissionLogError {
    #[error("Submission log '{path}' is not valid at line {line}: {reason}")]
    InvalidLine {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("Background write did not complete: {0}")]
    Join(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Any failure that ends a single task's lifecycle early.
///
/// The driver turns these into an `ERROR: ...` outcome; they never escape
/// past the driver.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error("Background work was aborted: {0}")]
    Join(String),
}
