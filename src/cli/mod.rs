//! Command-line interface for agent-vm-runner.
//!
//! Provides commands for running a dataset of tasks and inspecting
//! submission logs.

mod commands;

pub use commands::{parse_cli, run, run_with_cli, Cli};
