//! Task module - the units of work the platform hands out and the results sent back.
//!
//! Wire shapes:
//! - `/listen` responds with `{ "id": ..., "type": "...", "payload": {...} }`
//! - `/submit-result` receives `{ "taskId": ..., "result": { "success": ..., "data"?, "error"? } }`

use std::fmt;

use serde::{Deserialize, Serialize};

/// Row returned by a query, keyed by column name.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Opaque task identifier.
///
/// Any JSON value the platform sends (string, number of any size, even an object) is kept
/// as-is and echoed back unchanged in the result envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(serde_json::Value);

impl TaskId {
    pub fn as_value(&self) -> &serde_json::Value {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        TaskId(serde_json::Value::String(s.to_string()))
    }
}

impl From<i64> for TaskId {
    fn from(n: i64) -> Self {
        TaskId(serde_json::Value::from(n))
    }
}

/// Type tag of a task. Open-ended: unknown tags are carried through to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    /// Run a SQL query against the local database.
    pub const EXECUTE_QUERY: &'static str = "EXECUTE_QUERY";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A unit of work delivered by one successful poll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub kind: TaskKind,
    /// Type-specific data; absent for task types that carry none.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Payload of an `EXECUTE_QUERY` task.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryPayload {
    pub query: String,
}

/// Outcome of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResult {
    pub fn ok(data: serde_json::Value) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Body posted to `/submit-result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub task_id: TaskId,
    pub result: TaskResult,
}
