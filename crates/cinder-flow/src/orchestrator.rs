//! The dependency-resolution and recovery loop.
//!
//! The orchestrator is a single polling loop with three passes, executed in
//! order within each tick:
//!
//! 1. **Dependency resolution**: unblocks tasks whose dependencies all
//!    completed, propagating their artifacts downstream, and fails tasks
//!    whose dependencies failed
//! 2. **Lease reclamation**: returns tasks locked by dead workers to
//!    PENDING (or FAILED once retries are exhausted)
//! 3. **Workflow aggregation**: derives each workflow's status from its
//!    tasks
//!
//! Each pass is independently idempotent, so running multiple orchestrators
//! is safe (all writes are conditional updates), just unnecessary. The
//! orchestrator also maintains the heartbeat document the watchdog monitors.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;

use crate::error::Result;
use crate::log::{self, LogEvent};
use crate::metrics::FlowMetrics;
use crate::store::{LeaseCheck, Store, TaskFilter};
use crate::task::{RetryDecision, TaskDocument, TaskStatus};
use crate::workflow::aggregate_status;

const COMPONENT: &str = "orchestrator";

/// Error string recorded on tasks recovered from expired leases.
const LOCK_TIMEOUT_ERROR: &str = "lock timeout";

/// Error string recorded on tasks downstream of a failure.
const DEPENDENCY_FAILED_ERROR: &str = "dependency failed";

/// Orchestrator loop configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Tick cadence.
    pub poll_interval: Duration,
    /// Maximum IN_PROGRESS age before a lease is reclaimed.
    ///
    /// Must exceed the largest handler runtime with margin; it also bounds
    /// recovery latency, so tasks expected to exceed it should be
    /// decomposed rather than served by raising the TTL globally.
    pub lease_ttl: Duration,
    /// Sleep after a loop-level error before continuing.
    pub backoff_on_error: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            lease_ttl: Duration::from_secs(300),
            backoff_on_error: Duration::from_secs(5),
        }
    }
}

/// Counts of actions taken in one orchestrator tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Tasks transitioned BLOCKED -> PENDING.
    pub unblocked: usize,
    /// Tasks transitioned BLOCKED -> FAILED by failure propagation.
    pub failed_downstream: usize,
    /// Expired leases returned to PENDING.
    pub reclaimed: usize,
    /// Expired leases failed terminally (retries exhausted).
    pub exhausted: usize,
    /// Workflow status updates applied.
    pub workflows_updated: usize,
}

impl TickSummary {
    /// Returns true if the tick changed nothing.
    #[must_use]
    pub const fn is_quiet(&self) -> bool {
        self.unblocked == 0
            && self.failed_downstream == 0
            && self.reclaimed == 0
            && self.exhausted == 0
            && self.workflows_updated == 0
    }
}

/// The singleton recovery and resolution loop.
pub struct Orchestrator<S> {
    store: Arc<S>,
    config: OrchestratorConfig,
    metrics: FlowMetrics,
}

impl<S> Orchestrator<S>
where
    S: Store + 'static,
{
    /// Creates a new orchestrator over a store.
    #[must_use]
    pub fn new(store: Arc<S>, config: OrchestratorConfig) -> Self {
        Self {
            store,
            config,
            metrics: FlowMetrics::new(),
        }
    }

    /// Runs one tick: heartbeat, then the three passes in order.
    ///
    /// `now` is passed explicitly so recovery behavior is testable without
    /// waiting out real lease TTLs.
    ///
    /// # Errors
    ///
    /// Returns an error on store-level failures. No task state is mutated
    /// by a failing scan; the next tick simply retries.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickSummary> {
        let _timer = self.metrics.start_tick(COMPONENT);

        self.store.beat_orchestrator(now).await?;

        let mut summary = TickSummary::default();
        self.resolve_dependencies(now, &mut summary).await?;
        self.reclaim_leases(now, &mut summary).await?;
        self.aggregate_workflows(&mut summary).await?;
        Ok(summary)
    }

    /// Pass 1: unblock tasks whose dependencies completed; propagate
    /// failures to tasks whose dependencies failed.
    async fn resolve_dependencies(
        &self,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        let blocked = self
            .store
            .list_tasks(&TaskFilter::new().with_status(TaskStatus::Blocked))
            .await?;

        for task in blocked {
            // The planner never inserts a dependency-free task as BLOCKED;
            // handled anyway so a malformed insert cannot strand a task.
            if task.dependencies.is_empty() {
                if self
                    .store
                    .unblock_task(&task.id, std::collections::BTreeMap::new())
                    .await?
                    .is_success()
                {
                    summary.unblocked += 1;
                }
                continue;
            }

            let mut outputs = std::collections::BTreeMap::new();
            let mut all_completed = true;
            let mut any_failed = false;
            let mut any_missing = false;

            for dep_id in &task.dependencies {
                match self.store.get_task(dep_id).await? {
                    Some(dep) => match dep.status {
                        TaskStatus::Completed => {
                            outputs.insert(
                                dep_id.clone(),
                                dep.output_artifact.unwrap_or(serde_json::Value::Null),
                            );
                        }
                        TaskStatus::Failed => {
                            any_failed = true;
                            all_completed = false;
                        }
                        _ => all_completed = false,
                    },
                    None => {
                        // Not visible yet (planner mid-insert); resolution
                        // is self-healing on the next tick.
                        any_missing = true;
                        all_completed = false;
                    }
                }
            }

            if any_missing {
                tracing::debug!(task_id = %task.id, "dependency not yet visible, leaving blocked");
                continue;
            }

            if all_completed {
                if self.store.unblock_task(&task.id, outputs).await?.is_success() {
                    summary.unblocked += 1;
                    log::record(
                        self.store.as_ref(),
                        LogEvent::info(
                            COMPONENT,
                            format!("Task {} unblocked, all dependencies completed", task.id),
                        )
                        .with_workflow(task.workflow_id)
                        .with_task(task.id.clone()),
                    )
                    .await;
                }
            } else if any_failed
                && self
                    .store
                    .fail_blocked_task(&task.id, DEPENDENCY_FAILED_ERROR, now)
                    .await?
                    .is_success()
            {
                summary.failed_downstream += 1;
                self.metrics.record_failure(task.task_type.as_str());
                log::record(
                    self.store.as_ref(),
                    LogEvent::warn(
                        COMPONENT,
                        format!("Task {} failed: upstream dependency failed", task.id),
                    )
                    .with_workflow(task.workflow_id)
                    .with_task(task.id.clone()),
                )
                .await;
            }
        }

        Ok(())
    }

    /// Pass 2: recover tasks whose lease expired.
    async fn reclaim_leases(&self, now: DateTime<Utc>, summary: &mut TickSummary) -> Result<()> {
        let Ok(lease_ttl) = chrono::Duration::from_std(self.config.lease_ttl) else {
            return Err(crate::error::Error::configuration(
                "lease_ttl out of range",
            ));
        };
        let threshold = now - lease_ttl;
        let expired = self.store.expired_leases(threshold).await?;
        let lease = LeaseCheck::LockedBefore(threshold);

        for task in expired {
            self.reclaim_one(&task, &lease, now, summary).await?;
        }
        Ok(())
    }

    async fn reclaim_one(
        &self,
        task: &TaskDocument,
        lease: &LeaseCheck,
        now: DateTime<Utc>,
        summary: &mut TickSummary,
    ) -> Result<()> {
        match task.retry_decision() {
            RetryDecision::Retry(retry_count) => {
                let result = self
                    .store
                    .retry_task(&task.id, lease, retry_count, LOCK_TIMEOUT_ERROR)
                    .await?;
                if result.is_success() {
                    summary.reclaimed += 1;
                    self.metrics.record_reclaim();
                    log::record(
                        self.store.as_ref(),
                        LogEvent::warn(
                            COMPONENT,
                            format!(
                                "Recovered task {} from expired lease (retry {retry_count})",
                                task.id
                            ),
                        )
                        .with_workflow(task.workflow_id)
                        .with_task(task.id.clone()),
                    )
                    .await;
                } else {
                    tracing::debug!(task_id = %task.id, result = ?result, "lease no longer expired, skipping reclaim");
                }
            }
            RetryDecision::Exhausted(retry_count) => {
                let result = self
                    .store
                    .fail_task(&task.id, lease, retry_count, LOCK_TIMEOUT_ERROR, now)
                    .await?;
                if result.is_success() {
                    summary.exhausted += 1;
                    self.metrics.record_failure(task.task_type.as_str());
                    log::record(
                        self.store.as_ref(),
                        LogEvent::error(
                            COMPONENT,
                            format!("Task {} lease expired, retries exhausted", task.id),
                        )
                        .with_workflow(task.workflow_id)
                        .with_task(task.id.clone()),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Pass 3: derive workflow statuses from their tasks.
    async fn aggregate_workflows(&self, summary: &mut TickSummary) -> Result<()> {
        let workflows = self.store.list_workflows(true).await?;

        for workflow in workflows {
            let tasks = self
                .store
                .list_tasks(&TaskFilter::new().for_workflow(workflow.id))
                .await?;

            let Some(target) = aggregate_status(&tasks) else {
                continue;
            };
            if target == workflow.status {
                continue;
            }

            if self.store.set_workflow_status(&workflow.id, target).await? {
                summary.workflows_updated += 1;
                if target.is_terminal() {
                    self.metrics.record_workflow_terminal(target.as_label());
                    log::record(
                        self.store.as_ref(),
                        LogEvent::info(
                            COMPONENT,
                            format!("Workflow {} finished as {target}", workflow.id),
                        )
                        .with_workflow(workflow.id),
                    )
                    .await;
                }
            }
        }
        Ok(())
    }

    /// Runs the polling loop until `shutdown` flips to true.
    ///
    /// Loop-level errors are logged at WARN and absorbed with
    /// `backoff_on_error`; nothing terminates the loop except the shutdown
    /// signal.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("orchestrator started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let sleep_for = match self.tick(Utc::now()).await {
                Ok(summary) => {
                    if !summary.is_quiet() {
                        tracing::debug!(?summary, "orchestrator tick");
                    }
                    self.config.poll_interval
                }
                Err(err) => {
                    tracing::warn!(error = %err, "orchestrator tick failed");
                    self.config.backoff_on_error
                }
            };

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                _ = shutdown.changed() => {}
            }
        }

        tracing::info!("orchestrator stopped");
    }
}

impl<S> std::fmt::Debug for Orchestrator<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
