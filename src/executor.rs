//! Task dispatch.
//!
//! A [`TaskRegistry`] maps type tags to [`TaskHandler`]s. Supporting a new task type is
//! one `register` call; the agent loop never branches on the tag itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::{DatabaseDescriptor, DbError, QueryBackend};
use crate::task::{QueryPayload, Task, TaskKind, TaskResult};

/// Per-task failure. Always reported back to the platform, never fatal to the loop.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("unrecognized task type")]
    UnrecognizedType,

    #[error("database not configured")]
    ConfigurationMissing,

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("{0}")]
    Database(#[from] DbError),
}

/// Inputs a handler may need besides the task itself.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    /// Descriptor pinned when the task was dispatched.
    pub database: Option<DatabaseDescriptor>,
}

/// Executes one task type.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Type tag this handler is registered under.
    fn kind(&self) -> &'static str;

    /// Run the task and produce the `data` part of a successful result.
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Runs `EXECUTE_QUERY` tasks against the site database.
pub struct ExecuteQueryHandler {
    backend: Arc<dyn QueryBackend>,
}

impl ExecuteQueryHandler {
    pub fn new(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl TaskHandler for ExecuteQueryHandler {
    fn kind(&self) -> &'static str {
        TaskKind::EXECUTE_QUERY
    }

    async fn handle(&self, task: &Task, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
        let descriptor = ctx.database.as_ref().ok_or(TaskError::ConfigurationMissing)?;
        let payload: QueryPayload = serde_json::from_value(task.payload.clone())
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;

        let rows = self.backend.run_query(descriptor, &payload.query).await?;
        tracing::debug!(task_id = %task.id, rows = rows.len(), "Query completed");
        Ok(serde_json::Value::Array(
            rows.into_iter().map(serde_json::Value::Object).collect(),
        ))
    }
}

/// Dispatch table from type tag to handler.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    /// Empty registry; every task is unrecognized.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in handlers.
    pub fn with_defaults(backend: Arc<dyn QueryBackend>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ExecuteQueryHandler::new(backend)));
        registry
    }

    /// Register a handler under its own tag, replacing any previous one.
    pub fn register(&mut self, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(handler.kind().to_string(), handler);
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Execute a task. Every failure is folded into the returned result.
    pub async fn execute(&self, task: &Task, ctx: &TaskContext) -> TaskResult {
        let outcome = match self.handlers.get(task.kind.as_str()) {
            Some(handler) => handler.handle(task, ctx).await,
            None => Err(TaskError::UnrecognizedType),
        };

        match outcome {
            Ok(data) => TaskResult::ok(data),
            Err(e) => TaskResult::failed(e.to_string()),
        }
    }
}
