//! Pluggable storage for scheduling state.
//!
//! The [`Store`] trait defines the persistence layer every component talks
//! to. All coordination (claims, retries, lease reclamation, dependency
//! resolution) goes through these operations, and every process is
//! stateless on top of them.
//!
//! ## Design Principles
//!
//! - **Single-document atomicity**: Each mutating method corresponds to one
//!   conditional update on one document (a `find_one_and_update` in document
//!   stores). No multi-document transactions are required.
//! - **CAS semantics**: Conditional methods return [`CasResult`] instead of
//!   erroring when the document moved underneath the caller, because losing
//!   a race is a normal outcome in this protocol.
//! - **Testability**: In-memory implementation for testing; any store with
//!   per-document compare-and-update can back production.

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use cinder_core::{TaskId, WorkerId, WorkflowId};

use crate::error::Result;
use crate::log::{LogEvent, LogFilter};
use crate::task::{TaskDocument, TaskStatus, TaskType};
use crate::watchdog::OrchestratorHeartbeat;
use crate::worker::WorkerRegistration;
use crate::workflow::{Workflow, WorkflowStatus};

/// Result of a conditional single-document update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The update was applied.
    Success,
    /// The document does not exist.
    NotFound,
    /// The document's status did not match the condition.
    StateMismatch {
        /// The actual status that was found.
        actual: TaskStatus,
    },
    /// The document is IN_PROGRESS but the lease expectation failed: the
    /// lock changed hands (reclaim then re-claim) since the caller read it.
    LostLease,
}

impl CasResult {
    /// Returns true if the operation succeeded.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Returns true if the document was not found.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }
}

/// Lease expectation attached to a conditional update on an IN_PROGRESS task.
///
/// A worker finishing its own task asserts it still holds the lock; the
/// orchestrator reclaiming an expired lease asserts the lock predates its
/// scan threshold, so a freshly re-claimed task is never reclaimed twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseCheck {
    /// The task must still be locked by this worker.
    HeldBy(WorkerId),
    /// The task's lock must predate this instant.
    LockedBefore(DateTime<Utc>),
}

impl LeaseCheck {
    /// Returns true if the task's current lease satisfies this expectation.
    #[must_use]
    pub fn matches(&self, task: &TaskDocument) -> bool {
        match self {
            Self::HeldBy(worker_id) => task.worker_lock.as_ref() == Some(worker_id),
            Self::LockedBefore(threshold) => {
                task.locked_at.is_none_or(|locked_at| locked_at < *threshold)
            }
        }
    }
}

/// Filter for task listings.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Restrict to one workflow.
    pub workflow_id: Option<WorkflowId>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
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

    /// Restricts the filter to one status.
    #[must_use]
    pub const fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Returns true if the task passes the filter.
    #[must_use]
    pub fn accepts(&self, task: &TaskDocument) -> bool {
        self.workflow_id
            .is_none_or(|workflow_id| task.workflow_id == workflow_id)
            && self.status.is_none_or(|status| task.status == status)
    }
}

/// Storage abstraction for scheduling state.
///
/// ## Atomicity contract
///
/// [`Store::claim_task`] is the core primitive for distributed correctness:
/// it must atomically select one matching PENDING task and transition it to
/// IN_PROGRESS, such that concurrent callers never receive the same task.
/// Every other conditional method must apply its filter and update as one
/// atomic step against the single named document.
///
/// ## Indexing
///
/// Backing stores should index `(status, type)`, `(status, locked_at)`,
/// `workflow_id`, and `dependencies` for scan performance; the indexes
/// carry no semantic contract.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync` to support concurrent access from many
/// worker tasks and the orchestrator.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Workflow operations ---

    /// Inserts a workflow document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::DuplicateId`] if the id exists.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()>;

    /// Gets a workflow by ID. Returns `None` if it does not exist.
    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>>;

    /// Lists workflows, optionally restricted to non-terminal ones.
    ///
    /// Results are ordered by creation time ascending.
    async fn list_workflows(&self, only_active: bool) -> Result<Vec<Workflow>>;

    /// Sets a workflow's status.
    ///
    /// Condition: the stored status is non-terminal and differs from the
    /// target. Terminal workflows are never resurrected by aggregation.
    /// Returns true if the update was applied, false if it was a no-op
    /// (missing workflow, terminal status, or already at the target).
    async fn set_workflow_status(
        &self,
        workflow_id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<bool>;

    // --- Task operations ---

    /// Inserts a task document.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::DuplicateId`] if the id exists.
    async fn insert_task(&self, task: &TaskDocument) -> Result<()>;

    /// Gets a task by ID. Returns `None` if it does not exist.
    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskDocument>>;

    /// Lists tasks matching a filter, ordered by `(created_at, id)`.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDocument>>;

    /// Atomically claims one PENDING task of one of the given types.
    ///
    /// Filter: `status = PENDING ∧ type ∈ task_types`. Update: status to
    /// IN_PROGRESS, `worker_lock = worker_id`, `locked_at = now`. Selection
    /// is FIFO by `(created_at, id)`; the ordering guarantee is starvation
    /// freedom, not strict fairness.
    ///
    /// Returns the claimed task's post-image, or `None` if nothing matched.
    /// Exactly one concurrent caller can win any given task.
    async fn claim_task(
        &self,
        task_types: &[TaskType],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskDocument>>;

    /// Completes an IN_PROGRESS task with its artifact.
    ///
    /// Condition: `status = IN_PROGRESS` and `lease` holds. Update: status
    /// COMPLETED, `output_artifact`, lock cleared, `completed_at = now`.
    async fn complete_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        artifact: Value,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    /// Releases an IN_PROGRESS task back to PENDING for another attempt.
    ///
    /// Condition: `status = IN_PROGRESS` and `lease` holds. Update: status
    /// PENDING, `retry_count`, `last_error`, lock cleared.
    async fn retry_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        retry_count: u32,
        error: &str,
    ) -> Result<CasResult>;

    /// Terminally fails an IN_PROGRESS task.
    ///
    /// Condition: `status = IN_PROGRESS` and `lease` holds. Update: status
    /// FAILED, `retry_count`, `last_error`, lock cleared, `failed_at = now`.
    async fn fail_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    /// Unblocks a task whose dependencies all completed.
    ///
    /// Condition: `status = BLOCKED`. Update: status PENDING,
    /// `dependency_outputs` merged into the input context.
    async fn unblock_task(
        &self,
        task_id: &TaskId,
        dependency_outputs: BTreeMap<TaskId, Value>,
    ) -> Result<CasResult>;

    /// Fails a BLOCKED task whose dependency failed.
    ///
    /// Condition: `status = BLOCKED`. Update: status FAILED, `last_error`,
    /// `failed_at = now`.
    async fn fail_blocked_task(
        &self,
        task_id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CasResult>;

    /// Lists IN_PROGRESS tasks whose lock predates `locked_before`.
    ///
    /// A task with a missing `locked_at` while IN_PROGRESS counts as
    /// expired; that state violates the lock invariant and should be
    /// recovered rather than stranded.
    async fn expired_leases(&self, locked_before: DateTime<Utc>) -> Result<Vec<TaskDocument>>;

    // --- Worker registry ---

    /// Creates or refreshes a worker registration.
    async fn upsert_worker(&self, registration: &WorkerRegistration) -> Result<()>;

    /// Lists all worker registrations.
    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>>;

    // --- Orchestrator heartbeat ---

    /// Refreshes the singleton orchestrator heartbeat document.
    async fn beat_orchestrator(&self, now: DateTime<Utc>) -> Result<()>;

    /// Reads the orchestrator heartbeat document, if it exists.
    async fn get_orchestrator_heartbeat(&self) -> Result<Option<OrchestratorHeartbeat>>;

    /// Increments the orchestrator restart counter and marks the heartbeat
    /// document RESTARTING. Returns the new restart count.
    async fn record_orchestrator_restart(&self) -> Result<u32>;

    // --- Logs ---

    /// Appends an immutable log event.
    async fn append_log(&self, event: LogEvent) -> Result<()>;

    /// Reads log events matching a filter, most recent first.
    async fn recent_logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>>;
}
