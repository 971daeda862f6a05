//! Append-only operational log events.
//!
//! Every component mirrors its significant events into the store's log
//! collection so the control plane can serve them, in addition to emitting
//! them through `tracing`. Log documents are never mutated or deleted by
//! the core; no read path depends on them existing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cinder_core::{TaskId, WorkflowId};

use crate::store::Store;

/// Severity of a log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    /// Routine progress.
    Info,
    /// Recoverable anomaly.
    Warn,
    /// Failure requiring operator attention.
    Error,
}

impl LogLevel {
    /// Returns a lowercase label suitable for display.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// An immutable operational event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    /// When the event occurred.
    pub timestamp: DateTime<Utc>,
    /// Severity.
    pub level: LogLevel,
    /// Emitting component (`worker`, `orchestrator`, `watchdog`, `planner`, `api`).
    pub component: String,
    /// Human-readable description.
    pub message: String,
    /// Workflow scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<WorkflowId>,
    /// Task scope, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
}

impl LogEvent {
    /// Creates a new event at the given level.
    #[must_use]
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            workflow_id: None,
            task_id: None,
        }
    }

    /// Creates an INFO event.
    #[must_use]
    pub fn info(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, component, message)
    }

    /// Creates a WARN event.
    #[must_use]
    pub fn warn(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Warn, component, message)
    }

    /// Creates an ERROR event.
    #[must_use]
    pub fn error(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, component, message)
    }

    /// Scopes the event to a workflow.
    #[must_use]
    pub const fn with_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Scopes the event to a task.
    #[must_use]
    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Returns true if this event describes recovery activity (lease
    /// reclamation, retries, watchdog resurrection).
    ///
    /// The control plane uses this to let operators watch recovery happen.
    #[must_use]
    pub fn is_recovery_event(&self) -> bool {
        let lower = self.message.to_lowercase();
        lower.contains("recover") || lower.contains("retry")
    }
}

/// Filter for log reads. Results are most recent first.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    /// Restrict to one workflow.
    pub workflow_id: Option<WorkflowId>,
    /// Restrict to recovery events.
    pub recovery_only: bool,
    /// Maximum number of events to return.
    pub limit: Option<usize>,
}

impl LogFilter {
    /// Creates an unrestricted filter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the filter to one workflow.
    #[must_use]
    pub const fn for_workflow(mut self, workflow_id: WorkflowId) -> Self {
        self.workflow_id = Some(workflow_id);
        self
    }

    /// Restricts the filter to recovery events.
    #[must_use]
    pub const fn recovery_only(mut self) -> Self {
        self.recovery_only = true;
        self
    }

    /// Caps the number of returned events.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Appends an event to the store's log collection, also emitting it via
/// `tracing`.
///
/// Log failures never interrupt the caller: a store that cannot accept a
/// log write is reported at WARN and otherwise ignored.
pub async fn record<S: Store + ?Sized>(store: &S, event: LogEvent) {
    match event.level {
        LogLevel::Info => tracing::info!(component = %event.component, "{}", event.message),
        LogLevel::Warn => tracing::warn!(component = %event.component, "{}", event.message),
        LogLevel::Error => tracing::error!(component = %event.component, "{}", event.message),
    }

    if let Err(err) = store.append_log(event).await {
        tracing::warn!(error = %err, "failed to append log event to store");
    }
}
