//! Task handler trait and registry.
//!
//! A handler is the pluggable unit of computation behind a task type. The
//! worker claims a task, looks up the handler for the task's type in its
//! registry, and executes it. Handlers must be idempotent or safe-on-retry:
//! the lease and retry mechanisms can invoke a handler more than once for
//! the same task id when processes crash.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use cinder_core::WorkerId;

use crate::store::Store;
use crate::task::{TaskDocument, TaskType};

/// Error raised by a task handler.
///
/// Its display string becomes the task's `last_error` and drives the retry
/// policy; the substrate does not distinguish handler error kinds.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    /// Description of the failure.
    pub message: String,
}

impl HandlerError {
    /// Creates a new handler error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

/// The result of a handler invocation: an artifact, or an error that enters
/// retry handling.
pub type HandlerResult = std::result::Result<Value, HandlerError>;

/// Execution context passed to handlers.
///
/// Carries the store handle because the PLAN handler inserts child task
/// documents; all other handlers mutate the store only through their
/// returned artifact.
#[derive(Clone)]
pub struct HandlerContext {
    /// The shared store.
    pub store: Arc<dyn Store>,
    /// The worker executing the task.
    pub worker_id: WorkerId,
}

impl HandlerContext {
    /// Creates a new handler context.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, worker_id: WorkerId) -> Self {
        Self { store, worker_id }
    }
}

/// Per-task-type logic invoked by a worker.
///
/// Input: the claimed task document, including its `input_context` with any
/// propagated `dependency_outputs`. Output: an artifact stored verbatim on
/// the task, or an error.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Executes the handler against a claimed task.
    async fn execute(&self, ctx: &HandlerContext, task: &TaskDocument) -> HandlerResult;
}

/// Registry mapping task-type tags to handlers.
///
/// A worker takes a registry (or a subset of its tags) at construction;
/// the set of registered tags is the set of tasks the worker claims.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for a task type, replacing any existing one.
    #[must_use]
    pub fn with_handler(mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(task_type, handler);
        self
    }

    /// Registers a handler for a task type in place.
    pub fn register(&mut self, task_type: TaskType, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type, handler);
    }

    /// Looks up the handler for a task type.
    #[must_use]
    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    /// Returns the registered task types, sorted for determinism.
    #[must_use]
    pub fn task_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// Returns true if no handlers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("task_types", &self.task_types())
            .finish()
    }
}

/// A handler that returns a fixed artifact.
///
/// Useful for wiring reference workers and for tests.
#[derive(Debug, Clone)]
pub struct StaticHandler {
    artifact: Value,
}

impl StaticHandler {
    /// Creates a handler returning the given artifact.
    #[must_use]
    pub const fn new(artifact: Value) -> Self {
        Self { artifact }
    }

    /// Creates a handler returning `{"ok": <task id>}`.
    #[must_use]
    pub fn ok() -> Self {
        Self::new(Value::Null)
    }
}

#[async_trait]
impl TaskHandler for StaticHandler {
    async fn execute(&self, _ctx: &HandlerContext, task: &TaskDocument) -> HandlerResult {
        if self.artifact.is_null() {
            Ok(serde_json::json!({ "ok": task.id.as_str() }))
        } else {
            Ok(self.artifact.clone())
        }
    }
}

/// A handler that always fails with a fixed message.
#[derive(Debug, Clone)]
pub struct FailingHandler {
    message: String,
}

impl FailingHandler {
    /// Creates a new failing handler.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl TaskHandler for FailingHandler {
    async fn execute(&self, _ctx: &HandlerContext, _task: &TaskDocument) -> HandlerResult {
        Err(HandlerError::new(self.message.clone()))
    }
}
