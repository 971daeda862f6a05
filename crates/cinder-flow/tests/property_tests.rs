//! Property-based tests for scheduling invariants.
//!
//! These tests use proptest to verify invariants hold across randomly
//! generated DAGs and failure patterns, plus a concurrent stress test for
//! claim exclusivity.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use proptest::prelude::*;
use serde_json::json;
use tokio_test::block_on;

use cinder_core::{TaskId, WorkflowId};
use cinder_flow::handler::{HandlerContext, HandlerError, HandlerRegistry, TaskHandler};
use cinder_flow::orchestrator::{Orchestrator, OrchestratorConfig};
use cinder_flow::store::memory::InMemoryStore;
use cinder_flow::store::{Store, TaskFilter};
use cinder_flow::task::{TaskDocument, TaskStatus, TaskType};
use cinder_flow::worker::{TickOutcome, Worker, WorkerConfig};

/// A random DAG: task `i` may depend on any subset of tasks `0..i` (each
/// mask bit `d` is an edge `d -> i`), which makes the graph acyclic by
/// construction.
fn arb_dag() -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2usize..8).prop_flat_map(|n| {
        prop::collection::vec(any::<u64>(), n).prop_map(|masks| {
            masks
                .iter()
                .enumerate()
                .map(|(i, mask)| (0..i).filter(|d| mask & (1 << d) != 0).collect())
                .collect()
        })
    })
}

/// A handler that checks the dependency gate at execution time: every
/// dependency must be COMPLETED in the store at the instant the handler
/// observes the task, and the propagated artifacts must match.
struct GateCheckingHandler {
    violations: Arc<Mutex<Vec<String>>>,
    executions: Arc<Mutex<HashMap<TaskId, usize>>>,
}

#[async_trait::async_trait]
impl TaskHandler for GateCheckingHandler {
    async fn execute(
        &self,
        ctx: &HandlerContext,
        task: &TaskDocument,
    ) -> Result<serde_json::Value, HandlerError> {
        *self
            .executions
            .lock()
            .expect("lock")
            .entry(task.id.clone())
            .or_insert(0) += 1;

        for dep_id in &task.dependencies {
            let dep = ctx
                .store
                .get_task(dep_id)
                .await
                .map_err(|e| HandlerError::new(e.to_string()))?;
            match dep {
                Some(dep) if dep.status == TaskStatus::Completed => {
                    let propagated = task.input_context.dependency_outputs.get(dep_id);
                    if propagated != dep.output_artifact.as_ref() {
                        self.violations.lock().expect("lock").push(format!(
                            "task {} saw stale artifact for {dep_id}",
                            task.id
                        ));
                    }
                }
                other => {
                    self.violations.lock().expect("lock").push(format!(
                        "task {} ran with incomplete dependency {dep_id}: {other:?}",
                        task.id
                    ));
                }
            }
        }

        Ok(json!({ "ok": task.id.as_str() }))
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Any acyclic DAG runs to full completion with the dependency gate
    /// and artifact flow holding at every handler invocation.
    #[test]
    fn random_dags_complete_with_dependency_gate_held(dag in arb_dag()) {
        block_on(async move {
            let store = Arc::new(InMemoryStore::new());
            let violations = Arc::new(Mutex::new(Vec::new()));
            let executions = Arc::new(Mutex::new(HashMap::new()));

            let registry = HandlerRegistry::new().with_handler(
                TaskType::search(),
                Arc::new(GateCheckingHandler {
                    violations: Arc::clone(&violations),
                    executions: Arc::clone(&executions),
                }),
            );
            let worker = Worker::new(
                Arc::clone(&store),
                Arc::new(registry),
                WorkerConfig::default(),
            );
            let orch = Orchestrator::new(Arc::clone(&store), OrchestratorConfig::default());

            let workflow_id = WorkflowId::generate();
            let ids: Vec<TaskId> = (0..dag.len())
                .map(|i| TaskId::child_of(&workflow_id, &format!("t{i}")))
                .collect();

            for (i, deps) in dag.iter().enumerate() {
                let dependencies = deps.iter().map(|&d| ids[d].clone()).collect();
                let task = TaskDocument::new(
                    ids[i].clone(),
                    workflow_id,
                    TaskType::search(),
                    dependencies,
                );
                store.insert_task(&task).await.expect("insert");
            }

            // Drive to quiescence.
            for _ in 0..64 {
                let summary = orch.tick(Utc::now()).await.expect("orch tick");
                let mut claimed = false;
                while worker.tick(Utc::now()).await.expect("worker tick") == TickOutcome::Claimed {
                    claimed = true;
                }
                if summary.is_quiet() && !claimed {
                    break;
                }
            }

            // Progress: every task terminal, and since no handler fails,
            // every task completed exactly once.
            for id in &ids {
                let task = store.get_task(id).await.expect("read").expect("exists");
                prop_assert_eq!(task.status, TaskStatus::Completed, "task {}", id);
                prop_assert_eq!(task.retry_count, 0);

                let keys: HashSet<_> =
                    task.input_context.dependency_outputs.keys().cloned().collect();
                let deps: HashSet<_> = task.dependencies.iter().cloned().collect();
                prop_assert_eq!(keys, deps, "artifact keys mismatch for {}", id);
            }

            let violations = violations.lock().expect("lock");
            prop_assert!(violations.is_empty(), "gate violations: {violations:?}");

            let executions = executions.lock().expect("lock");
            for id in &ids {
                prop_assert_eq!(executions.get(id), Some(&1), "task {} reran", id);
            }

            Ok(())
        })?;
    }

    /// Retry counters are monotonic and bounded by max_retries + 1, and a
    /// handler that eventually succeeds converges to COMPLETED.
    #[test]
    fn flaky_handlers_converge_with_monotonic_retries(
        failures_before_success in 0u32..5,
        max_retries in 0u32..5,
    ) {
        block_on(async move {
            struct FlakyHandler {
                remaining_failures: AtomicUsize,
            }

            #[async_trait::async_trait]
            impl TaskHandler for FlakyHandler {
                async fn execute(
                    &self,
                    _ctx: &HandlerContext,
                    task: &TaskDocument,
                ) -> Result<serde_json::Value, HandlerError> {
                    let remaining = self.remaining_failures.load(Ordering::SeqCst);
                    if remaining > 0 {
                        self.remaining_failures.store(remaining - 1, Ordering::SeqCst);
                        Err(HandlerError::new("flaky"))
                    } else {
                        Ok(json!({ "ok": task.id.as_str() }))
                    }
                }
            }

            let store = Arc::new(InMemoryStore::new());
            let registry = HandlerRegistry::new().with_handler(
                TaskType::search(),
                Arc::new(FlakyHandler {
                    remaining_failures: AtomicUsize::new(failures_before_success as usize),
                }),
            );
            let worker = Worker::new(
                Arc::clone(&store),
                Arc::new(registry),
                WorkerConfig::default(),
            );

            let workflow_id = WorkflowId::generate();
            let task = TaskDocument::new(
                TaskId::child_of(&workflow_id, "a"),
                workflow_id,
                TaskType::search(),
                vec![],
            )
            .with_max_retries(max_retries);
            let task_id = task.id.clone();
            store.insert_task(&task).await.expect("insert");

            let mut last_retry_count = 0;
            for _ in 0..16 {
                if worker.tick(Utc::now()).await.expect("tick") == TickOutcome::Idle {
                    break;
                }
                let doc = store.get_task(&task_id).await.expect("read").expect("exists");
                prop_assert!(
                    doc.retry_count >= last_retry_count,
                    "retry count decreased: {} -> {}",
                    last_retry_count,
                    doc.retry_count
                );
                last_retry_count = doc.retry_count;
            }

            let doc = store.get_task(&task_id).await.expect("read").expect("exists");
            prop_assert!(doc.retry_count <= max_retries + 1);

            if failures_before_success <= max_retries {
                prop_assert_eq!(doc.status, TaskStatus::Completed);
                prop_assert_eq!(doc.retry_count, failures_before_success);
            } else {
                prop_assert_eq!(doc.status, TaskStatus::Failed);
                prop_assert_eq!(doc.retry_count, max_retries + 1);
            }

            Ok(())
        })?;
    }
}

/// A handler that tracks in-flight executions per task id to catch any
/// overlap two workers could produce for the same task.
struct ExclusivityHandler {
    in_flight: Arc<Mutex<HashSet<TaskId>>>,
    overlaps: Arc<AtomicUsize>,
    completions: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl TaskHandler for ExclusivityHandler {
    async fn execute(
        &self,
        _ctx: &HandlerContext,
        task: &TaskDocument,
    ) -> Result<serde_json::Value, HandlerError> {
        {
            let mut in_flight = self.in_flight.lock().expect("lock");
            if !in_flight.insert(task.id.clone()) {
                self.overlaps.fetch_add(1, Ordering::SeqCst);
            }
        }

        tokio::time::sleep(std::time::Duration::from_millis(2)).await;

        self.in_flight.lock().expect("lock").remove(&task.id);
        self.completions.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": task.id.as_str() }))
    }
}

/// Claim exclusivity under real concurrency: many workers polling the same
/// store never execute the same task twice or concurrently.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_workers_never_share_a_claim() {
    const TASKS: usize = 32;
    const WORKERS: usize = 6;

    let store = Arc::new(InMemoryStore::new());
    let in_flight = Arc::new(Mutex::new(HashSet::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));
    let completions = Arc::new(AtomicUsize::new(0));

    let workflow_id = WorkflowId::generate();
    for i in 0..TASKS {
        let task = TaskDocument::new(
            TaskId::child_of(&workflow_id, &format!("t{i:02}")),
            workflow_id,
            TaskType::search(),
            vec![],
        );
        store.insert_task(&task).await.expect("insert");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();
    for i in 0..WORKERS {
        let registry = HandlerRegistry::new().with_handler(
            TaskType::search(),
            Arc::new(ExclusivityHandler {
                in_flight: Arc::clone(&in_flight),
                overlaps: Arc::clone(&overlaps),
                completions: Arc::clone(&completions),
            }),
        );
        let worker = Worker::new(
            Arc::clone(&store),
            Arc::new(registry),
            WorkerConfig {
                name: format!("stress-{i}"),
                poll_interval: std::time::Duration::from_millis(1),
                backoff_on_error: std::time::Duration::from_millis(1),
            },
        );
        let shutdown_rx = shutdown_rx.clone();
        handles.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
    }

    // Wait until everything is terminal.
    for _ in 0..500 {
        let completed = store
            .list_tasks(&TaskFilter::new().with_status(TaskStatus::Completed))
            .await
            .expect("list");
        if completed.len() == TASKS {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    shutdown_tx.send(true).expect("shutdown");
    for handle in handles {
        handle.await.expect("join");
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0, "concurrent executions of one task");
    assert_eq!(completions.load(Ordering::SeqCst), TASKS, "every task ran exactly once");

    let completed = store
        .list_tasks(&TaskFilter::new().with_status(TaskStatus::Completed))
        .await
        .expect("list");
    assert_eq!(completed.len(), TASKS);
}
