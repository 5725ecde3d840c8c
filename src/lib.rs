//! agent-vm-runner: run AI agents against benchmark tasks in ephemeral
//! remote environments.
//!
//! Each task gets its own freshly provisioned environment. Outcomes are
//! appended to a durable submission log before the environment is
//! destroyed, so a crashed run can be inspected and resumed.

pub mod cli;
pub mod error;
pub mod metrics;
pub mod runner;
pub mod scheduler;

// Re-export commonly used types
pub use error::{ConfigError, ProviderError, StagingError, SubmissionLogError, TaskError};
pub use runner::{RemoteProvider, RunnerConfig, Task, TaskDriver, TaskOutcome};
pub use scheduler::BatchScheduler;
