//! Task documents and lifecycle management.
//!
//! This module provides:
//! - `TaskStatus`: The state machine for task scheduling
//! - `TaskType`: The tag a worker uses to select claimable tasks
//! - `TaskDocument`: The durable unit of scheduling
//! - `InputContext`: The structured payload handlers receive, including
//!   artifacts propagated from completed dependencies

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cinder_core::{TaskId, WorkerId, WorkflowId};

/// Default maximum retry attempts for a task.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Task scheduling state machine.
///
/// States follow a directed graph:
/// ```text
///        planner insert
///  (empty) ────────────► BLOCKED ──deps all COMPLETED──► PENDING
///                           │                               │
///                           └──any dep FAILED──► FAILED     │ atomic claim
///                                                 ▲         ▼
///                                          retries exceeded IN_PROGRESS
///                                                 ▲         │
///                                 retry_count++   │         │ handler ok
///            PENDING ◄──handler fails, retries left┘        ▼
///               ▲                                        COMPLETED
///               │
///        lease timeout: IN_PROGRESS with a stale lock
///        returns to PENDING (or FAILED if exhausted)
/// ```
///
/// Planner insertions start in `Pending` when the task has no
/// dependencies, else `Blocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Waiting on at least one incomplete dependency.
    Blocked,
    /// Eligible for an atomic claim by any worker of the matching type.
    Pending,
    /// Exclusively held by one worker under a lease.
    InProgress,
    /// Finished with an artifact. Terminal.
    Completed,
    /// Exhausted retries, or a dependency failed. Terminal.
    Failed,
}

impl TaskStatus {
    /// Returns true if this is a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Blocked => matches!(target, Self::Pending | Self::Failed),
            Self::Pending => matches!(target, Self::InProgress),
            Self::InProgress => {
                matches!(target, Self::Completed | Self::Failed | Self::Pending)
            }
            Self::Completed | Self::Failed => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Blocked => "blocked",
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Blocked => write!(f, "BLOCKED"),
            Self::Pending => write!(f, "PENDING"),
            Self::InProgress => write!(f, "IN_PROGRESS"),
            Self::Completed => write!(f, "COMPLETED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

/// The tag that routes a task to workers able to execute it.
///
/// Task types are an open extension point: workers declare the set of tags
/// they claim and the handler registry maps each tag to executable logic.
/// Well-known tags have constructors; anything else goes through
/// [`TaskType::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    /// Wraps an arbitrary task-type tag.
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    /// The planning task type; its handler materializes child task graphs.
    #[must_use]
    pub fn plan() -> Self {
        Self::new("PLAN")
    }

    /// Information-retrieval tasks.
    #[must_use]
    pub fn search() -> Self {
        Self::new("SEARCH")
    }

    /// Summarization tasks.
    #[must_use]
    pub fn summarize() -> Self {
        Self::new("SUMMARIZE")
    }

    /// Code-generation tasks.
    #[must_use]
    pub fn code_generate() -> Self {
        Self::new("CODE_GENERATE")
    }

    /// Validation tasks.
    #[must_use]
    pub fn validate() -> Self {
        Self::new("VALIDATE")
    }

    /// Analysis tasks.
    #[must_use]
    pub fn analyze() -> Self {
        Self::new("ANALYZE")
    }

    /// Infrastructure-provisioning tasks.
    #[must_use]
    pub fn provision_infra() -> Self {
        Self::new("PROVISION_INFRA")
    }

    /// Synthesis tasks that combine upstream artifacts.
    #[must_use]
    pub fn synthesize() -> Self {
        Self::new("SYNTHESIZE")
    }

    /// Returns the tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskType {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Structured input payload for a task handler.
///
/// `dependency_outputs` is populated by the orchestrator's dependency
/// resolution pass when the task unblocks; it is the sole mechanism by which
/// artifacts flow downstream. Any other fields the submitter attached ride
/// along in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InputContext {
    /// The user goal, present on PLAN tasks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,

    /// Artifacts of completed dependencies, keyed by dependency task id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependency_outputs: BTreeMap<TaskId, Value>,

    /// Submitter-defined payload fields.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl InputContext {
    /// Creates an empty input context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an input context carrying a goal (for PLAN tasks).
    #[must_use]
    pub fn with_goal(goal: impl Into<String>) -> Self {
        Self {
            goal: Some(goal.into()),
            ..Self::default()
        }
    }

    /// Merges dependency artifacts into the context.
    ///
    /// Existing entries are overwritten, so re-running resolution against an
    /// already-augmented context is idempotent.
    pub fn merge_dependency_outputs(&mut self, outputs: BTreeMap<TaskId, Value>) {
        self.dependency_outputs.extend(outputs);
    }
}

/// Decision produced by the shared retry policy.
///
/// Both the worker's failure path and the orchestrator's lease reclamation
/// apply the same accounting: attempt `retry_count + 1`, terminal once the
/// attempt exceeds `max_retries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Release the task back to PENDING with the given retry count.
    Retry(u32),
    /// Retries exhausted; fail terminally with the given retry count.
    Exhausted(u32),
}

/// The durable unit of scheduling.
///
/// All coordination state lives on this document: status, the worker lock
/// and lease timestamp, retry accounting, the input payload, and the output
/// artifact. Every mutation after insertion is a single-document
/// conditional update through the [`crate::store::Store`] contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDocument {
    /// Unique task id, conventionally `<workflow_id>_<local_id>`.
    pub id: TaskId,
    /// The workflow this task belongs to.
    pub workflow_id: WorkflowId,
    /// Tag routing the task to capable workers.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Scheduling state.
    pub status: TaskStatus,
    /// Ids of tasks in the same workflow that must complete first.
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Number of failed attempts so far.
    #[serde(default)]
    pub retry_count: u32,
    /// Maximum failed attempts before the task fails terminally.
    pub max_retries: u32,
    /// Worker currently holding the task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_lock: Option<WorkerId>,
    /// When the current lease was taken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    /// Structured handler input.
    #[serde(default)]
    pub input_context: InputContext,
    /// Handler output; present iff the task is COMPLETED.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_artifact: Option<Value>,
    /// Most recent failure description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// When the task document was inserted.
    pub created_at: DateTime<Utc>,
    /// When the task completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// When the task failed terminally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl TaskDocument {
    /// Creates a new task document.
    ///
    /// The initial status is `Pending` when `dependencies` is empty, else
    /// `Blocked`.
    #[must_use]
    pub fn new(
        id: TaskId,
        workflow_id: WorkflowId,
        task_type: TaskType,
        dependencies: Vec<TaskId>,
    ) -> Self {
        let status = if dependencies.is_empty() {
            TaskStatus::Pending
        } else {
            TaskStatus::Blocked
        };

        Self {
            id,
            workflow_id,
            task_type,
            status,
            dependencies,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            worker_lock: None,
            locked_at: None,
            input_context: InputContext::new(),
            output_artifact: None,
            last_error: None,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }

    /// Sets the maximum retry attempts.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the handler input payload.
    #[must_use]
    pub fn with_input_context(mut self, input_context: InputContext) -> Self {
        self.input_context = input_context;
        self
    }

    /// Overrides the creation timestamp (claim ordering is FIFO by this
    /// field, so tests pin it for determinism).
    #[must_use]
    pub const fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Returns true if the task is in a terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if this task's lease has expired at `now`.
    ///
    /// Only meaningful for IN_PROGRESS tasks; other states never expire.
    #[must_use]
    pub fn lease_expired(&self, now: DateTime<Utc>, lease_ttl: chrono::Duration) -> bool {
        if self.status != TaskStatus::InProgress {
            return false;
        }

        self.locked_at
            .is_none_or(|locked_at| locked_at + lease_ttl < now)
    }

    /// Applies the retry policy to the next failed attempt.
    #[must_use]
    pub const fn retry_decision(&self) -> RetryDecision {
        let attempt = self.retry_count + 1;
        if attempt <= self.max_retries {
            RetryDecision::Retry(attempt)
        } else {
            RetryDecision::Exhausted(attempt)
        }
    }
}
