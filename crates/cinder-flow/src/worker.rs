//! The worker polling loop.
//!
//! A worker is one cooperative loop that claims and executes a single task
//! at a time. It is oblivious to workflows, dependencies, and other
//! workers; its only contract is with the store. Workers are designed to be
//! killed at any point: a task held by a dead worker is recovered by the
//! orchestrator's lease reclamation, so the worker performs no local crash
//! recovery of its own.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use cinder_core::WorkerId;

use crate::error::Result;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::log::{self, LogEvent};
use crate::metrics::FlowMetrics;
use crate::store::{CasResult, LeaseCheck, Store};
use crate::task::{RetryDecision, TaskDocument, TaskType};

const COMPONENT: &str = "worker";

/// Liveness of a worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    /// Heartbeating and claiming tasks.
    Online,
    /// Shut down gracefully.
    Offline,
}

/// Heartbeat record a worker maintains in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    /// Stable worker identifier.
    pub worker_id: WorkerId,
    /// Human-readable name.
    pub name: String,
    /// Task types this worker claims.
    pub task_types: Vec<TaskType>,
    /// Liveness.
    pub status: WorkerStatus,
    /// Last polling tick.
    pub last_heartbeat: DateTime<Utc>,
}

/// Worker loop configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Human-readable worker name.
    pub name: String,
    /// Sleep between store scans when no task was claimed.
    pub poll_interval: Duration,
    /// Sleep after a loop-level error before continuing.
    pub backoff_on_error: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            poll_interval: Duration::from_secs(1),
            backoff_on_error: Duration::from_secs(5),
        }
    }
}

/// Outcome of one worker tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A task was claimed and executed; claim again immediately.
    Claimed,
    /// Nothing was eligible; sleep for the poll interval.
    Idle,
}

/// A long-lived polling loop owning a set of task types.
pub struct Worker<S> {
    id: WorkerId,
    task_types: Vec<TaskType>,
    store: Arc<S>,
    handlers: Arc<HandlerRegistry>,
    config: WorkerConfig,
    metrics: FlowMetrics,
}

impl<S> Worker<S>
where
    S: Store + 'static,
{
    /// Creates a worker claiming every task type in the registry.
    #[must_use]
    pub fn new(store: Arc<S>, handlers: Arc<HandlerRegistry>, config: WorkerConfig) -> Self {
        let task_types = handlers.task_types();
        Self {
            id: WorkerId::generate(),
            task_types,
            store,
            handlers,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Pins the worker to a stable identifier.
    #[must_use]
    pub const fn with_id(mut self, id: WorkerId) -> Self {
        self.id = id;
        self
    }

    /// Restricts the worker to a subset of the registry's task types.
    #[must_use]
    pub fn with_task_types(mut self, task_types: Vec<TaskType>) -> Self {
        self.task_types = task_types;
        self
    }

    /// Returns the worker's identifier.
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Returns the task types this worker claims.
    #[must_use]
    pub fn task_types(&self) -> &[TaskType] {
        &self.task_types
    }

    fn registration(&self, status: WorkerStatus, now: DateTime<Utc>) -> WorkerRegistration {
        WorkerRegistration {
            worker_id: self.id,
            name: self.config.name.clone(),
            task_types: self.task_types.clone(),
            status,
            last_heartbeat: now,
        }
    }

    /// Runs one polling tick: refresh the registration, attempt a claim,
    /// and execute the claimed task to a state write.
    ///
    /// # Errors
    ///
    /// Returns an error only for store-level failures; handler failures are
    /// absorbed into task state.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let _timer = self.metrics.start_tick(COMPONENT);

        self.store
            .upsert_worker(&self.registration(WorkerStatus::Online, now))
            .await?;

        let Some(task) = self
            .store
            .claim_task(&self.task_types, &self.id, now)
            .await?
        else {
            return Ok(TickOutcome::Idle);
        };

        self.metrics.record_claim(task.task_type.as_str());
        tracing::debug!(task_id = %task.id, task_type = %task.task_type, "claimed task");

        self.execute(task).await?;
        Ok(TickOutcome::Claimed)
    }

    /// Executes a claimed task through its handler and commits the outcome.
    async fn execute(&self, task: TaskDocument) -> Result<()> {
        // A claim outside our declared set should be impossible; release it
        // rather than executing logic we never advertised.
        if !self.task_types.contains(&task.task_type) {
            return self
                .release_invariant_violation(&task, "claimed task outside declared task types")
                .await;
        }

        let Some(handler) = self.handlers.get(&task.task_type) else {
            return self
                .release_invariant_violation(&task, "no handler registered for claimed task type")
                .await;
        };

        let store: Arc<dyn Store> = self.store.clone();
        let ctx = HandlerContext::new(store, self.id);
        let lease = LeaseCheck::HeldBy(self.id);

        match handler.execute(&ctx, &task).await {
            Ok(artifact) => {
                let result = self
                    .store
                    .complete_task(&task.id, &lease, artifact, Utc::now())
                    .await?;
                match result {
                    CasResult::Success => {
                        self.metrics.record_completion(task.task_type.as_str());
                        log::record(
                            self.store.as_ref(),
                            LogEvent::info(COMPONENT, format!("Task {} completed", task.id))
                                .with_workflow(task.workflow_id)
                                .with_task(task.id.clone()),
                        )
                        .await;
                    }
                    other => {
                        // The lease was reclaimed while the handler ran; the
                        // artifact is discarded and the retry attempt owns
                        // the task now.
                        tracing::warn!(
                            task_id = %task.id,
                            result = ?other,
                            "lease lost before completion; outcome discarded"
                        );
                    }
                }
            }
            Err(err) => self.handle_failure(&task, &lease, &err.to_string()).await?,
        }

        Ok(())
    }

    /// Applies the retry policy after a handler failure.
    async fn handle_failure(
        &self,
        task: &TaskDocument,
        lease: &LeaseCheck,
        error: &str,
    ) -> Result<()> {
        match task.retry_decision() {
            RetryDecision::Retry(retry_count) => {
                let result = self
                    .store
                    .retry_task(&task.id, lease, retry_count, error)
                    .await?;
                if result.is_success() {
                    self.metrics.record_retry(task.task_type.as_str());
                    log::record(
                        self.store.as_ref(),
                        LogEvent::warn(
                            COMPONENT,
                            format!("Task {} failed, retry {retry_count} scheduled: {error}", task.id),
                        )
                        .with_workflow(task.workflow_id)
                        .with_task(task.id.clone()),
                    )
                    .await;
                } else {
                    tracing::warn!(task_id = %task.id, result = ?result, "retry release lost the lease");
                }
            }
            RetryDecision::Exhausted(retry_count) => {
                let result = self
                    .store
                    .fail_task(&task.id, lease, retry_count, error, Utc::now())
                    .await?;
                if result.is_success() {
                    self.metrics.record_failure(task.task_type.as_str());
                    log::record(
                        self.store.as_ref(),
                        LogEvent::error(
                            COMPONENT,
                            format!(
                                "Task {} failed terminally after {retry_count} attempts: {error}",
                                task.id
                            ),
                        )
                        .with_workflow(task.workflow_id)
                        .with_task(task.id.clone()),
                    )
                    .await;
                } else {
                    tracing::warn!(task_id = %task.id, result = ?result, "terminal failure write lost the lease");
                }
            }
        }
        Ok(())
    }

    /// Releases a task claimed in violation of the worker's contract.
    async fn release_invariant_violation(&self, task: &TaskDocument, reason: &str) -> Result<()> {
        log::record(
            self.store.as_ref(),
            LogEvent::error(
                COMPONENT,
                format!("Invariant violation on task {}: {reason}", task.id),
            )
            .with_workflow(task.workflow_id)
            .with_task(task.id.clone()),
        )
        .await;

        let result = self
            .store
            .retry_task(
                &task.id,
                &LeaseCheck::HeldBy(self.id),
                task.retry_count + 1,
                reason,
            )
            .await?;
        if !result.is_success() {
            tracing::warn!(task_id = %task.id, result = ?result, "invariant release lost the lease");
        }
        Ok(())
    }

    /// Runs the polling loop until `shutdown` flips to true.
    ///
    /// Loop-level errors (transient store failures) are logged at WARN and
    /// absorbed with `backoff_on_error`; nothing terminates the loop except
    /// the shutdown signal. On graceful shutdown the registration is set
    /// OFFLINE but any held lease is left to expire; the orchestrator's
    /// reclamation is the single source of truth for recovery.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(worker_id = %self.id, name = %self.config.name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match self.tick(Utc::now()).await {
                Ok(TickOutcome::Claimed) => continue,
                Ok(TickOutcome::Idle) => self.config.poll_interval,
                Err(err) => {
                    tracing::warn!(worker_id = %self.id, error = %err, "worker tick failed");
                    self.config.backoff_on_error
                }
            };

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }

        if let Err(err) = self
            .store
            .upsert_worker(&self.registration(WorkerStatus::Offline, Utc::now()))
            .await
        {
            tracing::warn!(worker_id = %self.id, error = %err, "failed to mark worker offline");
        }
        tracing::info!(worker_id = %self.id, "worker stopped");
    }
}

impl<S> std::fmt::Debug for Worker<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("task_types", &self.task_types)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
