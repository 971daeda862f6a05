//! In-memory store implementation.
//!
//! This module provides [`InMemoryStore`], a thread-safe in-memory
//! implementation of the [`Store`] trait suitable for testing, development,
//! and single-process deployments.
//!
//! ## Limitations
//!
//! - **Single-process only**: State is not shared across process boundaries
//! - **No persistence**: All state is lost when the process exits
//!
//! Cross-process deployments implement [`Store`] against a shared document
//! store with per-document compare-and-update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use cinder_core::{TaskId, WorkerId, WorkflowId};

use super::{CasResult, LeaseCheck, Store, TaskFilter};
use crate::error::{Error, Result};
use crate::log::{LogEvent, LogFilter};
use crate::task::{TaskDocument, TaskStatus, TaskType};
use crate::watchdog::{HeartbeatStatus, OrchestratorHeartbeat};
use crate::worker::WorkerRegistration;
use crate::workflow::{Workflow, WorkflowStatus};

#[derive(Debug, Default)]
struct Collections {
    workflows: HashMap<WorkflowId, Workflow>,
    tasks: HashMap<TaskId, TaskDocument>,
    workers: HashMap<WorkerId, WorkerRegistration>,
    orchestrator_heartbeat: Option<OrchestratorHeartbeat>,
    logs: Vec<LogEvent>,
}

/// In-memory store.
///
/// Provides a simple, thread-safe implementation of the [`Store`] trait
/// using `RwLock` for synchronization. Every mutating method holds the
/// write lock for its full filter-and-update step, which is what gives the
/// conditional updates their single-document atomicity here.
///
/// ## Example
///
/// ```rust
/// use cinder_flow::store::memory::InMemoryStore;
///
/// let store = InMemoryStore::new();
/// // Use store in tests...
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Collections>,
}

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl InMemoryStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of task documents currently stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is poisoned.
    pub fn task_count(&self) -> Result<usize> {
        let count = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.tasks.len()
        };
        Ok(count)
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.workflows.contains_key(&workflow.id) {
            return Err(Error::DuplicateId {
                id: workflow.id.to_string(),
            });
        }
        inner.workflows.insert(workflow.id, workflow.clone());
        Ok(())
    }

    async fn get_workflow(&self, workflow_id: &WorkflowId) -> Result<Option<Workflow>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.workflows.get(workflow_id).cloned()
        };
        Ok(result)
    }

    async fn list_workflows(&self, only_active: bool) -> Result<Vec<Workflow>> {
        let mut workflows: Vec<Workflow> = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .workflows
                .values()
                .filter(|w| !only_active || !w.is_terminal())
                .cloned()
                .collect()
        };
        workflows.sort_by_key(|w| (w.created_at, w.id));
        Ok(workflows)
    }

    async fn set_workflow_status(
        &self,
        workflow_id: &WorkflowId,
        status: WorkflowStatus,
    ) -> Result<bool> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(workflow) = inner.workflows.get_mut(workflow_id) else {
            return Ok(false);
        };
        if workflow.is_terminal() || workflow.status == status {
            return Ok(false);
        }
        workflow.status = status;
        Ok(true)
    }

    async fn insert_task(&self, task: &TaskDocument) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        if inner.tasks.contains_key(&task.id) {
            return Err(Error::DuplicateId {
                id: task.id.to_string(),
            });
        }
        inner.tasks.insert(task.id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<TaskDocument>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.tasks.get(task_id).cloned()
        };
        Ok(result)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDocument>> {
        let mut tasks: Vec<TaskDocument> = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .tasks
                .values()
                .filter(|t| filter.accepts(t))
                .cloned()
                .collect()
        };
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(tasks)
    }

    async fn claim_task(
        &self,
        task_types: &[TaskType],
        worker_id: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskDocument>> {
        let mut inner = self.inner.write().map_err(poison_err)?;

        let candidate = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Pending && task_types.contains(&t.task_type))
            .map(|t| (t.created_at, t.id.clone()))
            .min();

        let Some((_, task_id)) = candidate else {
            return Ok(None);
        };
        let Some(task) = inner.tasks.get_mut(&task_id) else {
            return Ok(None);
        };

        task.status = TaskStatus::InProgress;
        task.worker_lock = Some(*worker_id);
        task.locked_at = Some(now);
        Ok(Some(task.clone()))
    }

    async fn complete_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        artifact: Value,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(CasResult::StateMismatch {
                actual: task.status,
            });
        }
        if !lease.matches(task) {
            return Ok(CasResult::LostLease);
        }

        task.status = TaskStatus::Completed;
        task.output_artifact = Some(artifact);
        task.worker_lock = None;
        task.locked_at = None;
        task.completed_at = Some(now);
        Ok(CasResult::Success)
    }

    async fn retry_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        retry_count: u32,
        error: &str,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(CasResult::StateMismatch {
                actual: task.status,
            });
        }
        if !lease.matches(task) {
            return Ok(CasResult::LostLease);
        }

        task.status = TaskStatus::Pending;
        task.retry_count = retry_count;
        task.last_error = Some(error.to_string());
        task.worker_lock = None;
        task.locked_at = None;
        Ok(CasResult::Success)
    }

    async fn fail_task(
        &self,
        task_id: &TaskId,
        lease: &LeaseCheck,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != TaskStatus::InProgress {
            return Ok(CasResult::StateMismatch {
                actual: task.status,
            });
        }
        if !lease.matches(task) {
            return Ok(CasResult::LostLease);
        }

        task.status = TaskStatus::Failed;
        task.retry_count = retry_count;
        task.last_error = Some(error.to_string());
        task.worker_lock = None;
        task.locked_at = None;
        task.failed_at = Some(now);
        Ok(CasResult::Success)
    }

    async fn unblock_task(
        &self,
        task_id: &TaskId,
        dependency_outputs: BTreeMap<TaskId, Value>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != TaskStatus::Blocked {
            return Ok(CasResult::StateMismatch {
                actual: task.status,
            });
        }

        task.status = TaskStatus::Pending;
        task.input_context.merge_dependency_outputs(dependency_outputs);
        Ok(CasResult::Success)
    }

    async fn fail_blocked_task(
        &self,
        task_id: &TaskId,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<CasResult> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let Some(task) = inner.tasks.get_mut(task_id) else {
            return Ok(CasResult::NotFound);
        };
        if task.status != TaskStatus::Blocked {
            return Ok(CasResult::StateMismatch {
                actual: task.status,
            });
        }

        task.status = TaskStatus::Failed;
        task.last_error = Some(error.to_string());
        task.failed_at = Some(now);
        Ok(CasResult::Success)
    }

    async fn expired_leases(&self, locked_before: DateTime<Utc>) -> Result<Vec<TaskDocument>> {
        let mut tasks: Vec<TaskDocument> = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner
                .tasks
                .values()
                .filter(|t| {
                    t.status == TaskStatus::InProgress
                        && t.locked_at.is_none_or(|locked_at| locked_at < locked_before)
                })
                .cloned()
                .collect()
        };
        tasks.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(tasks)
    }

    async fn upsert_worker(&self, registration: &WorkerRegistration) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner
            .workers
            .insert(registration.worker_id, registration.clone());
        Ok(())
    }

    async fn list_workers(&self) -> Result<Vec<WorkerRegistration>> {
        let mut workers: Vec<WorkerRegistration> = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.workers.values().cloned().collect()
        };
        workers.sort_by_key(|w| w.worker_id);
        Ok(workers)
    }

    async fn beat_orchestrator(&self, now: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let heartbeat = inner
            .orchestrator_heartbeat
            .get_or_insert_with(OrchestratorHeartbeat::default);
        heartbeat.last_heartbeat = Some(now);
        heartbeat.status = HeartbeatStatus::Running;
        Ok(())
    }

    async fn get_orchestrator_heartbeat(&self) -> Result<Option<OrchestratorHeartbeat>> {
        let result = {
            let inner = self.inner.read().map_err(poison_err)?;
            inner.orchestrator_heartbeat.clone()
        };
        Ok(result)
    }

    async fn record_orchestrator_restart(&self) -> Result<u32> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        let heartbeat = inner
            .orchestrator_heartbeat
            .get_or_insert_with(OrchestratorHeartbeat::default);
        heartbeat.restarts += 1;
        heartbeat.status = HeartbeatStatus::Restarting;
        Ok(heartbeat.restarts)
    }

    async fn append_log(&self, event: LogEvent) -> Result<()> {
        let mut inner = self.inner.write().map_err(poison_err)?;
        inner.logs.push(event);
        Ok(())
    }

    async fn recent_logs(&self, filter: &LogFilter) -> Result<Vec<LogEvent>> {
        let inner = self.inner.read().map_err(poison_err)?;
        let mut events: Vec<LogEvent> = inner
            .logs
            .iter()
            .filter(|e| {
                filter
                    .workflow_id
                    .is_none_or(|workflow_id| e.workflow_id == Some(workflow_id))
                    && (!filter.recovery_only || e.is_recovery_event())
            })
            .cloned()
            .collect();
        drop(inner);

        events.reverse();
        if let Some(limit) = filter.limit {
            events.truncate(limit);
        }
        Ok(events)
    }
}
