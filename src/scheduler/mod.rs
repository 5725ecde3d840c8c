//! Batch scheduling with a fixed concurrency limit.
//!
//! # Architecture
//!
//! ```text
//!                 ┌──────────────────┐
//!                 │  run_batch(tasks) │
//!                 └────────┬─────────┘
//!                          │  one future per task
//!                 ┌────────▼─────────┐
//!                 │ Semaphore (N)    │
//!                 └────────┬─────────┘
//!         ┌────────────────┼────────────────┐
//!         ▼                ▼                ▼
//!   ┌───────────┐    ┌───────────┐    ┌───────────┐
//!   │TaskDriver │    │TaskDriver │    │TaskDriver │
//!   └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use agent_vm_runner::scheduler::BatchScheduler;
//!
//! let scheduler = BatchScheduler::from_driver(Arc::new(driver));
//! let results = scheduler.run_batch(tasks).await;
//! ```

pub mod batch;

pub use batch::{BatchScheduler, BatchSummary};
