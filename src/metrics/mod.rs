//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks terminal outcomes, task durations, live environments and
//! non-fatal failures for one batch run.
//!
//! # Example
//!
//! ```ignore
//! use agent_vm_runner::metrics::RunnerMetrics;
//!
//! let metrics = RunnerMetrics::new()?;
//! // ... run a batch with these metrics ...
//! std::fs::write("metrics.prom", metrics.export())?;
//! ```

pub mod prometheus;

pub use self::prometheus::RunnerMetrics;
