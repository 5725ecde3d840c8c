//! Prometheus metrics for a batch run.
//!
//! Each run owns its own [`Registry`] so several runners (or tests) can live
//! in one process without colliding on metric names.

use std::time::Duration;

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::runner::best_effort::FailureStage;
use crate::runner::result::TaskOutcome;

/// Metrics collected while running a batch.
#[derive(Clone)]
pub struct RunnerMetrics {
    registry: Registry,
    tasks_total: IntCounterVec,
    task_duration: Histogram,
    active_environments: IntGauge,
    nonfatal_failures: IntCounterVec,
}

impl RunnerMetrics {
    /// Creates and registers every metric.
    ///
    /// # Errors
    ///
    /// Returns a `prometheus::Error` if a metric cannot be created or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let tasks_total = IntCounterVec::new(
            Opts::new(
                "agent_runner_tasks_total",
                "Tasks that reached a terminal outcome",
            ),
            &["outcome"],
        )?;

        let task_duration = Histogram::with_opts(
            HistogramOpts::new(
                "agent_runner_task_duration_seconds",
                "Wall time from provisioning to recorded outcome",
            )
            .buckets(vec![30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0, 7200.0, 14400.0]),
        )?;

        let active_environments = IntGauge::new(
            "agent_runner_active_environments",
            "Remote environments currently provisioned",
        )?;

        let nonfatal_failures = IntCounterVec::new(
            Opts::new(
                "agent_runner_nonfatal_failures_total",
                "Failures that were logged and did not end a task",
            ),
            &["stage"],
        )?;

        registry.register(Box::new(tasks_total.clone()))?;
        registry.register(Box::new(task_duration.clone()))?;
        registry.register(Box::new(active_environments.clone()))?;
        registry.register(Box::new(nonfatal_failures.clone()))?;

        Ok(Self {
            registry,
            tasks_total,
            task_duration,
            active_environments,
            nonfatal_failures,
        })
    }

    /// Records a task's terminal outcome and how long it took.
    pub fn record_outcome(&self, outcome: &TaskOutcome, duration: Duration) {
        self.tasks_total
            .with_label_values(&[outcome.label()])
            .inc();
        self.task_duration.observe(duration.as_secs_f64());
    }

    pub fn record_nonfatal(&self, stage: FailureStage) {
        self.nonfatal_failures
            .with_label_values(&[stage.as_str()])
            .inc();
    }

    pub fn environment_created(&self) {
        self.active_environments.inc();
    }

    pub fn environment_released(&self) {
        self.active_environments.dec();
    }

    /// Tasks recorded with the given outcome label.
    pub fn tasks_with_outcome(&self, label: &str) -> u64 {
        self.tasks_total.with_label_values(&[label]).get()
    }

    pub fn nonfatal_failures(&self, stage: FailureStage) -> u64 {
        self.nonfatal_failures
            .with_label_values(&[stage.as_str()])
            .get()
    }

    pub fn active_environments(&self) -> i64 {
        self.active_environments.get()
    }

    /// Renders every metric in the Prometheus text exposition format.
    pub fn export(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            return format!("# Error encoding metrics: {}\n", e);
        }

        String::from_utf8(buffer)
            .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
    }
}

impl std::fmt::Debug for RunnerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerMetrics")
            .field("active_environments", &self.active_environments.get())
            .finish_non_exhaustive()
    }
}
