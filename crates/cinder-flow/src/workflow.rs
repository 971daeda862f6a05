//! Workflow documents and status aggregation.
//!
//! A workflow is one record per user goal. It owns no scheduling state of
//! its own; its status is derived from its tasks by the orchestrator's
//! aggregation pass and is the sole externally-visible success or failure
//! signal.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cinder_core::WorkflowId;

use crate::task::{TaskDocument, TaskStatus};

/// The state of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    /// Created, no task activity observed yet.
    Pending,
    /// At least one task is pending or in progress.
    Running,
    /// Every task completed. Terminal.
    Completed,
    /// At least one task failed and none can still make progress. Terminal.
    Failed,
}

impl WorkflowStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// One workflow per user goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique identifier for this workflow.
    pub id: WorkflowId,
    /// The user goal, free text.
    pub goal: String,
    /// Current aggregated status.
    pub status: WorkflowStatus,
    /// When the workflow was created.
    pub created_at: DateTime<Utc>,
}

impl Workflow {
    /// Creates a new pending workflow for a goal.
    #[must_use]
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            id: WorkflowId::generate(),
            goal: goal.into(),
            status: WorkflowStatus::Pending,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the workflow is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Derives a workflow's status from its tasks.
///
/// - `Completed` iff every task is COMPLETED
/// - `Failed` iff at least one task is FAILED and no task is PENDING or
///   IN_PROGRESS
/// - `Running` iff at least one task is PENDING or IN_PROGRESS
/// - `None` otherwise (leave the stored status unchanged)
///
/// A workflow with no visible tasks yields `None`: its PLAN task may not
/// have been inserted yet, and aggregating over an empty set would complete
/// the workflow prematurely.
#[must_use]
pub fn aggregate_status(tasks: &[TaskDocument]) -> Option<WorkflowStatus> {
    if tasks.is_empty() {
        return None;
    }

    let all_completed = tasks.iter().all(|t| t.status == TaskStatus::Completed);
    if all_completed {
        return Some(WorkflowStatus::Completed);
    }

    let any_active = tasks
        .iter()
        .any(|t| matches!(t.status, TaskStatus::Pending | TaskStatus::InProgress));
    let any_failed = tasks.iter().any(|t| t.status == TaskStatus::Failed);

    if any_failed && !any_active {
        return Some(WorkflowStatus::Failed);
    }
    if any_active {
        return Some(WorkflowStatus::Running);
    }

    None
}
