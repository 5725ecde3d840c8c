//! Benchmark tasks submitted to the runner.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Key in the input payload holding auxiliary files to stage.
pub const FILES_KEY: &str = "files";

/// Key in the input payload that requests a GPU-capable environment.
pub const GPU_KEY: &str = "gpu";

/// Maps a task id to a single safe path component.
///
/// Characters outside `[A-Za-z0-9._-]` become `_`, and ids that would name
/// the current or parent directory are prefixed with `_`. Ids that are
/// already safe are returned unchanged.
pub fn task_path_component(task_id: &str) -> String {
    let component: String = task_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if component.chars().all(|c| c == '.') {
        format!("_{}", component)
    } else {
        component
    }
}

/// A single benchmark task. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Identifier, unique within a batch.
    pub id: String,
    /// Opaque input payload handed to the agent.
    pub input: Value,
    /// Whether the task must run on a GPU-capable environment.
    #[serde(default)]
    pub gpu: bool,
}

impl Task {
    /// Creates a CPU task.
    pub fn new(id: impl Into<String>, input: Value) -> Self {
        Self {
            id: id.into(),
            input,
            gpu: false,
        }
    }

    /// Creates a task from a dataset entry, reading the GPU flag from the
    /// payload's `gpu` field when present.
    pub fn from_entry(id: impl Into<String>, input: Value) -> Self {
        let gpu = input.get(GPU_KEY).and_then(Value::as_bool).unwrap_or(false);
        Self::new(id, input).with_gpu(gpu)
    }

    pub fn with_gpu(mut self, gpu: bool) -> Self {
        self.gpu = gpu;
        self
    }

    /// Auxiliary files declared by the payload, as (destination, local source).
    ///
    /// Entries whose source is not a string are ignored.
    pub fn files(&self) -> Vec<(String, PathBuf)> {
        self.input
            .get(FILES_KEY)
            .and_then(Value::as_object)
            .map(|files| {
                files
                    .iter()
                    .filter_map(|(dest, src)| {
                        src.as_str().map(|src| (dest.clone(), PathBuf::from(src)))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}
