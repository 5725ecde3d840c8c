//! Bounded-concurrency batch execution.
//!
//! Every task gets its own future; a semaphore with `max_concurrent` permits
//! gates them. A permit is taken before the environment is created and given
//! back only after the outcome is recorded and the environment deleted.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tracing::{error, info};

use crate::runner::{Task, TaskDriver, TaskOutcome};

/// Counts for a finished batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub timed_out: usize,
    pub errored: usize,
    /// Tasks skipped because a previous run already recorded them.
    pub resumed: usize,
}

impl BatchSummary {
    /// Tallies a result mapping.
    pub fn from_outcomes<'a>(outcomes: impl IntoIterator<Item = &'a TaskOutcome>) -> Self {
        let mut summary = Self::default();
        for outcome in outcomes {
            summary.total += 1;
            match outcome {
                TaskOutcome::Success(_) => summary.succeeded += 1,
                TaskOutcome::Timeout { .. } => summary.timed_out += 1,
                TaskOutcome::Error(_) => summary.errored += 1,
            }
        }
        summary
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.succeeded as f64 / self.total as f64) * 100.0
        }
    }
}

/// Runs batches of tasks through a [`TaskDriver`] with at most
/// `max_concurrent` of them in flight.
pub struct BatchScheduler {
    driver: Arc<TaskDriver>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
}

impl BatchScheduler {
    /// Creates a scheduler. A limit of zero is raised to one.
    pub fn new(driver: Arc<TaskDriver>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            driver,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
        }
    }

    /// Creates a scheduler using the driver's configured concurrency.
    pub fn from_driver(driver: Arc<TaskDriver>) -> Self {
        let max_concurrent = driver.config().max_concurrent;
        Self::new(driver, max_concurrent)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn driver(&self) -> &TaskDriver {
        &self.driver
    }

    /// Runs every task and returns one outcome per task id.
    ///
    /// Never fails: per-task errors are outcomes. When ids repeat, the
    /// outcome that finishes last wins in the returned map; the submission
    /// log holds every one of them.
    pub async fn run_batch(&self, tasks: Vec<Task>) -> BTreeMap<String, TaskOutcome> {
        let total = tasks.len();
        let completed = Arc::new(AtomicUsize::new(0));
        let started = Instant::now();

        info!(
            total,
            max_concurrent = self.max_concurrent,
            "Starting batch"
        );

        let mut futures = Vec::with_capacity(total);
        for task in tasks {
            let sem = Arc::clone(&self.semaphore);
            let driver = Arc::clone(&self.driver);
            let completed = Arc::clone(&completed);
            futures.push(async move {
                let outcome = match sem.acquire().await {
                    Ok(_permit) => driver.process(&task).await,
                    Err(e) => {
                        error!(task_id = %task.id, error = %e, "Concurrency limiter closed");
                        let outcome = TaskOutcome::error(format!("scheduler closed: {}", e));
                        driver.record(&task.id, &outcome).await;
                        outcome
                    }
                };

                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                info!(
                    task_id = %task.id,
                    outcome = outcome.label(),
                    completed = done,
                    total,
                    "Progress: {}/{} tasks finished",
                    done,
                    total
                );
                (task.id, outcome)
            });
        }

        let mut results = BTreeMap::new();
        for (task_id, outcome) in futures::future::join_all(futures).await {
            results.insert(task_id, outcome);
        }

        let summary = BatchSummary::from_outcomes(results.values());
        log_summary(&summary, started.elapsed());
        results
    }

    /// Runs only the tasks missing from `recorded` and merges the recorded
    /// outcomes into the result.
    ///
    /// `recorded` is typically [`SubmissionLog::load`] of the same run's
    /// log, so a crashed run is continued rather than repeated.
    ///
    /// [`SubmissionLog::load`]: crate::runner::SubmissionLog::load
    pub async fn run_batch_resuming(
        &self,
        tasks: Vec<Task>,
        recorded: BTreeMap<String, TaskOutcome>,
    ) -> BTreeMap<String, TaskOutcome> {
        let (done, pending): (Vec<Task>, Vec<Task>) = tasks
            .into_iter()
            .partition(|task| recorded.contains_key(&task.id));

        info!(
            resumed = done.len(),
            pending = pending.len(),
            "Resuming batch from recorded submissions"
        );

        let mut results: BTreeMap<String, TaskOutcome> = done
            .into_iter()
            .filter_map(|task| {
                recorded
                    .get(&task.id)
                    .map(|outcome| (task.id, outcome.clone()))
            })
            .collect();
        results.extend(self.run_batch(pending).await);
        results
    }
}

fn log_summary(summary: &BatchSummary, elapsed: Duration) {
    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        timed_out = summary.timed_out,
        errored = summary.errored,
        elapsed_secs = elapsed.as_secs(),
        "Batch finished ({:.1}% success)",
        summary.success_rate()
    );
}
