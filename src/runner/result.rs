//! Terminal outcomes for a task and their on-disk shape.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

const TIMEOUT_PREFIX: &str = "TIMEOUT after ";
const TIMEOUT_SUFFIX: &str = " seconds";
const ERROR_PREFIX: &str = "ERROR: ";

/// The single terminal outcome of a task.
///
/// Serialized as the bare value written to the submission log: the agent's
/// own value on success, `"TIMEOUT after {N} seconds"` on timeout and
/// `"ERROR: {message}"` on error.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// The remote agent finished and returned this value.
    Success(Value),
    /// The orchestrator stopped waiting after the configured timeout.
    Timeout { seconds: u64 },
    /// The task's lifecycle failed before a result was obtained.
    Error(String),
}

impl TaskOutcome {
    /// Creates a success outcome.
    pub fn success(value: Value) -> Self {
        Self::Success(value)
    }

    /// Creates a timeout outcome carrying the configured timeout.
    pub fn timeout(timeout: Duration) -> Self {
        Self::Timeout {
            seconds: timeout.as_secs(),
        }
    }

    /// Creates an error outcome from anything displayable.
    pub fn error(message: impl fmt::Display) -> Self {
        Self::Error(message.to_string())
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::Timeout { .. } => "timeout",
            Self::Error(_) => "error",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// Returns the value stored in the submission log for this outcome.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Success(value) => value.clone(),
            Self::Timeout { seconds } => {
                Value::String(format!("{TIMEOUT_PREFIX}{seconds}{TIMEOUT_SUFFIX}"))
            }
            Self::Error(message) => Value::String(format!("{ERROR_PREFIX}{message}")),
        }
    }

    /// Reconstructs an outcome from a value read back from the submission log.
    ///
    /// Strings in the timeout or error shape map back to those variants;
    /// everything else is a success value.
    pub fn from_value(value: Value) -> Self {
        if let Value::String(text) = &value {
            if let Some(message) = text.strip_prefix(ERROR_PREFIX) {
                return Self::Error(message.to_string());
            }
            if let Some(seconds) = text
                .strip_prefix(TIMEOUT_PREFIX)
                .and_then(|rest| rest.strip_suffix(TIMEOUT_SUFFIX))
                .and_then(|n| n.parse::<u64>().ok())
            {
                return Self::Timeout { seconds };
            }
        }
        Self::Success(value)
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success(_) => write!(f, "success"),
            Self::Timeout { seconds } => write!(f, "{TIMEOUT_PREFIX}{seconds}{TIMEOUT_SUFFIX}"),
            Self::Error(message) => write!(f, "{ERROR_PREFIX}{message}"),
        }
    }
}

impl Serialize for TaskOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for TaskOutcome {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(Self::from_value)
    }
}

/// One line of the submission log: `{"<task_id>": <outcome>}`.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionRecord {
    pub task_id: String,
    pub outcome: TaskOutcome,
}

impl SubmissionRecord {
    pub fn new(task_id: impl Into<String>, outcome: TaskOutcome) -> Self {
        Self {
            task_id: task_id.into(),
            outcome,
        }
    }

    /// Wraps the outcome under its task id. This is the only place the
    /// canonical shape is produced.
    pub fn to_value(&self) -> Value {
        let mut map = serde_json::Map::with_capacity(1);
        map.insert(self.task_id.clone(), self.outcome.to_value());
        Value::Object(map)
    }

    /// Encodes the record as a single JSON line without the trailing newline.
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value())
    }

    /// Parses one submission log line. A line may carry several task ids.
    pub fn parse_line(line: &str) -> Result<Vec<Self>, String> {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => Ok(map
                .into_iter()
                .map(|(task_id, value)| Self::new(task_id, TaskOutcome::from_value(value)))
                .collect()),
            Ok(other) => Err(format!("expected a JSON object, found {}", json_kind(&other))),
            Err(e) => Err(e.to_string()),
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
