//! End-to-end scenarios for the scheduling substrate.
//!
//! These tests drive workers and the orchestrator tick by tick against the
//! in-memory store, so every scenario is deterministic: no sleeps, no real
//! lease TTLs, and explicit clocks where recovery timing matters.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use cinder_core::{TaskId, WorkerId, WorkflowId};
use cinder_flow::handler::{
    FailingHandler, HandlerContext, HandlerError, HandlerRegistry, StaticHandler, TaskHandler,
};
use cinder_flow::orchestrator::{Orchestrator, OrchestratorConfig};
use cinder_flow::planner::{Plan, PlanHandler, PlanMetadata, StaticPlanner, TaskBlueprint};
use cinder_flow::store::memory::InMemoryStore;
use cinder_flow::store::{LeaseCheck, Store, TaskFilter};
use cinder_flow::task::{InputContext, TaskDocument, TaskStatus, TaskType};
use cinder_flow::worker::{TickOutcome, Worker, WorkerConfig};
use cinder_flow::workflow::{Workflow, WorkflowStatus};

/// A handler that counts invocations, for proving a handler never ran.
struct CountingHandler {
    count: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl TaskHandler for CountingHandler {
    async fn execute(
        &self,
        _ctx: &HandlerContext,
        task: &TaskDocument,
    ) -> Result<serde_json::Value, HandlerError> {
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(json!({ "ok": task.id.as_str() }))
    }
}

fn orchestrator(store: &Arc<InMemoryStore>) -> Orchestrator<InMemoryStore> {
    Orchestrator::new(Arc::clone(store), OrchestratorConfig::default())
}

fn task(workflow_id: WorkflowId, local: &str, task_type: TaskType, deps: &[&str]) -> TaskDocument {
    let dependencies = deps
        .iter()
        .map(|d| TaskId::child_of(&workflow_id, d))
        .collect();
    TaskDocument::new(
        TaskId::child_of(&workflow_id, local),
        workflow_id,
        task_type,
        dependencies,
    )
}

/// Alternates orchestrator and worker ticks until the system goes quiet.
async fn drive(orch: &Orchestrator<InMemoryStore>, workers: &[&Worker<InMemoryStore>]) {
    for _ in 0..64 {
        let summary = orch.tick(Utc::now()).await.expect("orchestrator tick");

        let mut claimed_any = false;
        for worker in workers {
            while worker.tick(Utc::now()).await.expect("worker tick") == TickOutcome::Claimed {
                claimed_any = true;
            }
        }

        if summary.is_quiet() && !claimed_any {
            return;
        }
    }
    panic!("system did not quiesce within the round budget");
}

async fn get(store: &InMemoryStore, id: &TaskId) -> TaskDocument {
    store
        .get_task(id)
        .await
        .expect("store read")
        .expect("task exists")
}

/// Scenario 1: diamond DAG, all success.
#[tokio::test]
async fn diamond_dag_completes_with_artifact_flow() {
    let store = Arc::new(InMemoryStore::new());
    let registry =
        HandlerRegistry::new().with_handler(TaskType::search(), Arc::new(StaticHandler::ok()));
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("diamond");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    let b = task(workflow_id, "b", TaskType::search(), &["a"]);
    let c = task(workflow_id, "c", TaskType::search(), &["a"]);
    let d = task(workflow_id, "d", TaskType::search(), &["b", "c"]);
    for t in [&a, &b, &c, &d] {
        store.insert_task(t).await.unwrap();
    }

    drive(&orch, &[&worker]).await;

    for t in [&a, &b, &c, &d] {
        let doc = get(&store, &t.id).await;
        assert_eq!(doc.status, TaskStatus::Completed, "task {}", t.id);
        assert_eq!(doc.retry_count, 0);
    }

    let d_doc = get(&store, &d.id).await;
    assert_eq!(
        d_doc.input_context.dependency_outputs.get(&b.id),
        Some(&json!({ "ok": b.id.as_str() }))
    );
    assert_eq!(
        d_doc.input_context.dependency_outputs.get(&c.id),
        Some(&json!({ "ok": c.id.as_str() }))
    );

    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

/// Scenario 2: lease reclamation recovers a task from a dead worker.
#[tokio::test]
async fn lease_reclamation_recovers_from_dead_worker() {
    let store = Arc::new(InMemoryStore::new());
    let registry =
        HandlerRegistry::new().with_handler(TaskType::search(), Arc::new(StaticHandler::ok()));
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("reclaim");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    store.insert_task(&a).await.unwrap();

    // A worker claims the task and then dies mid-handler: nothing ever
    // writes a final state for this attempt.
    let now = Utc::now();
    let dead_worker = WorkerId::generate();
    let claimed = store
        .claim_task(&[TaskType::search()], &dead_worker, now)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(claimed.id, a.id);
    assert_eq!(claimed.status, TaskStatus::InProgress);

    // Before the TTL the lease holds and no other worker can claim it.
    let summary = orch.tick(now).await.unwrap();
    assert_eq!(summary.reclaimed, 0);
    assert_eq!(worker.tick(now).await.unwrap(), TickOutcome::Idle);

    // One lease TTL plus one tick later, the orchestrator recovers it.
    let later = now + chrono::Duration::seconds(301);
    let summary = orch.tick(later).await.unwrap();
    assert_eq!(summary.reclaimed, 1);

    let doc = get(&store, &a.id).await;
    assert_eq!(doc.status, TaskStatus::Pending);
    assert_eq!(doc.retry_count, 1);
    assert_eq!(doc.last_error.as_deref(), Some("lock timeout"));

    // A live worker finishes the job.
    drive(&orch, &[&worker]).await;

    let doc = get(&store, &a.id).await;
    assert_eq!(doc.status, TaskStatus::Completed);
    assert_eq!(doc.retry_count, 1);
    assert_eq!(doc.last_error.as_deref(), Some("lock timeout"));

    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

/// Scenario 3: retry exhaustion walks PENDING -> ... -> FAILED.
#[tokio::test]
async fn retry_exhaustion_fails_terminally() {
    let store = Arc::new(InMemoryStore::new());
    let registry = HandlerRegistry::new()
        .with_handler(TaskType::search(), Arc::new(FailingHandler::new("boom")));
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("exhaustion");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]).with_max_retries(2);
    store.insert_task(&a).await.unwrap();

    // Attempt 1 and 2 release back to PENDING with the count stepping up.
    for expected_retry in 1..=2 {
        assert_eq!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Claimed);
        let doc = get(&store, &a.id).await;
        assert_eq!(doc.status, TaskStatus::Pending);
        assert_eq!(doc.retry_count, expected_retry);
        assert_eq!(doc.last_error.as_deref(), Some("boom"));
    }

    // Attempt 3 exceeds max_retries = 2 and is terminal.
    assert_eq!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Claimed);
    let doc = get(&store, &a.id).await;
    assert_eq!(doc.status, TaskStatus::Failed);
    assert_eq!(doc.retry_count, 3);
    assert_eq!(doc.last_error.as_deref(), Some("boom"));

    orch.tick(Utc::now()).await.unwrap();
    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

/// Scenario 4: dependency failure propagates without running downstream
/// handlers.
#[tokio::test]
async fn dependency_failure_propagates_down_the_chain() {
    let store = Arc::new(InMemoryStore::new());
    let downstream_runs = Arc::new(AtomicUsize::new(0));

    let registry = HandlerRegistry::new()
        .with_handler(TaskType::search(), Arc::new(FailingHandler::new("boom")))
        .with_handler(
            TaskType::summarize(),
            Arc::new(CountingHandler {
                count: Arc::clone(&downstream_runs),
            }),
        );
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("propagation");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]).with_max_retries(0);
    let b = task(workflow_id, "b", TaskType::summarize(), &["a"]);
    let c = task(workflow_id, "c", TaskType::summarize(), &["b"]);
    for t in [&a, &b, &c] {
        store.insert_task(t).await.unwrap();
    }

    drive(&orch, &[&worker]).await;

    let a_doc = get(&store, &a.id).await;
    assert_eq!(a_doc.status, TaskStatus::Failed);
    assert_eq!(a_doc.last_error.as_deref(), Some("boom"));

    for t in [&b, &c] {
        let doc = get(&store, &t.id).await;
        assert_eq!(doc.status, TaskStatus::Failed, "task {}", t.id);
        assert_eq!(doc.last_error.as_deref(), Some("dependency failed"));
    }

    assert_eq!(downstream_runs.load(Ordering::SeqCst), 0);

    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Failed);
}

/// Scenario 5: a PLAN task expands into children that then run in order.
#[tokio::test]
async fn planner_expansion_runs_children_in_order() {
    let store = Arc::new(InMemoryStore::new());

    let plan = Plan::new()
        .with_task(TaskBlueprint::new("x", TaskType::search()))
        .with_task(TaskBlueprint::new("y", TaskType::summarize()).depends_on("x"));
    let registry = HandlerRegistry::new()
        .with_handler(
            TaskType::plan(),
            Arc::new(PlanHandler::new(Arc::new(StaticPlanner::new(plan)))),
        )
        .with_handler(TaskType::search(), Arc::new(StaticHandler::ok()))
        .with_handler(TaskType::summarize(), Arc::new(StaticHandler::ok()));
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("plan the research");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let plan_task = task(workflow_id, "plan", TaskType::plan(), &[])
        .with_input_context(InputContext::with_goal("plan the research"));
    store.insert_task(&plan_task).await.unwrap();

    drive(&orch, &[&worker]).await;

    let x_id = TaskId::child_of(&workflow_id, "x");
    let y_id = TaskId::child_of(&workflow_id, "y");

    let plan_doc = get(&store, &plan_task.id).await;
    assert_eq!(plan_doc.status, TaskStatus::Completed);
    let metadata: PlanMetadata =
        serde_json::from_value(plan_doc.output_artifact.unwrap()).unwrap();
    assert_eq!(metadata.created_task_ids, vec![x_id.clone(), y_id.clone()]);
    assert_eq!(metadata.edges, vec![(x_id.clone(), y_id.clone())]);

    let y_doc = get(&store, &y_id).await;
    assert_eq!(y_doc.status, TaskStatus::Completed);
    assert_eq!(
        y_doc.input_context.dependency_outputs.get(&x_id),
        Some(&json!({ "ok": x_id.as_str() }))
    );

    // Children never depend on the PLAN task itself.
    for id in [&x_id, &y_id] {
        let doc = get(&store, id).await;
        assert!(!doc.dependencies.contains(&plan_task.id));
    }

    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

/// Scenario 6: without the orchestrator nothing unblocks; restarting it
/// resumes the workflow from the store alone.
#[tokio::test]
async fn stopped_orchestrator_strands_blocked_tasks_until_restart() {
    let store = Arc::new(InMemoryStore::new());
    let registry =
        HandlerRegistry::new().with_handler(TaskType::search(), Arc::new(StaticHandler::ok()));
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::new(registry),
        WorkerConfig::default(),
    );

    let workflow = Workflow::new("diamond without a resolver");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    let b = task(workflow_id, "b", TaskType::search(), &["a"]);
    let c = task(workflow_id, "c", TaskType::search(), &["a"]);
    let d = task(workflow_id, "d", TaskType::search(), &["b", "c"]);
    for t in [&a, &b, &c, &d] {
        store.insert_task(t).await.unwrap();
    }

    // Only workers run: A completes, everything downstream stays BLOCKED
    // no matter how long the workers poll.
    assert_eq!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Claimed);
    for _ in 0..5 {
        assert_eq!(worker.tick(Utc::now()).await.unwrap(), TickOutcome::Idle);
    }

    assert_eq!(get(&store, &a.id).await.status, TaskStatus::Completed);
    for t in [&b, &c, &d] {
        assert_eq!(get(&store, &t.id).await.status, TaskStatus::Blocked);
    }

    // A fresh orchestrator instance picks up from store state alone.
    let orch = orchestrator(&store);
    let summary = orch.tick(Utc::now()).await.unwrap();
    assert_eq!(summary.unblocked, 2);

    drive(&orch, &[&worker]).await;

    let workflow = store.get_workflow(&workflow_id).await.unwrap().unwrap();
    assert_eq!(workflow.status, WorkflowStatus::Completed);
}

/// Two workers with disjoint task types cooperate on one workflow.
#[tokio::test]
async fn workers_with_disjoint_types_share_a_workflow() {
    let store = Arc::new(InMemoryStore::new());

    let search_registry =
        HandlerRegistry::new().with_handler(TaskType::search(), Arc::new(StaticHandler::ok()));
    let summarize_registry = HandlerRegistry::new()
        .with_handler(TaskType::summarize(), Arc::new(StaticHandler::ok()));
    let searcher = Worker::new(
        Arc::clone(&store),
        Arc::new(search_registry),
        WorkerConfig {
            name: "searcher".into(),
            ..WorkerConfig::default()
        },
    );
    let summarizer = Worker::new(
        Arc::clone(&store),
        Arc::new(summarize_registry),
        WorkerConfig {
            name: "summarizer".into(),
            ..WorkerConfig::default()
        },
    );
    let orch = orchestrator(&store);

    let workflow = Workflow::new("mixed types");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    let b = task(workflow_id, "b", TaskType::summarize(), &["a"]);
    store.insert_task(&a).await.unwrap();
    store.insert_task(&b).await.unwrap();

    drive(&orch, &[&searcher, &summarizer]).await;

    assert_eq!(get(&store, &a.id).await.status, TaskStatus::Completed);
    assert_eq!(get(&store, &b.id).await.status, TaskStatus::Completed);

    // Each worker registered itself.
    let workers = store.list_workers().await.unwrap();
    assert_eq!(workers.len(), 2);
}

/// The lease write path: a reclaimed task's late completion is discarded.
#[tokio::test]
async fn late_completion_after_reclaim_is_discarded() {
    let store = Arc::new(InMemoryStore::new());

    let workflow = Workflow::new("late write");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    store.insert_task(&a).await.unwrap();

    let now = Utc::now();
    let slow_worker = WorkerId::generate();
    store
        .claim_task(&[TaskType::search()], &slow_worker, now)
        .await
        .unwrap()
        .unwrap();

    // The orchestrator reclaims after the TTL...
    let orch = orchestrator(&store);
    let later = now + chrono::Duration::seconds(301);
    assert_eq!(orch.tick(later).await.unwrap().reclaimed, 1);

    // ...and another worker re-claims.
    let fast_worker = WorkerId::generate();
    store
        .claim_task(&[TaskType::search()], &fast_worker, later)
        .await
        .unwrap()
        .unwrap();

    // The slow worker finally finishes its handler and tries to commit;
    // its lease is gone, so the write loses.
    let result = store
        .complete_task(
            &a.id,
            &LeaseCheck::HeldBy(slow_worker),
            json!({"stale": true}),
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(!result.is_success());

    let doc = get(&store, &a.id).await;
    assert_eq!(doc.status, TaskStatus::InProgress);
    assert_eq!(doc.worker_lock, Some(fast_worker));
    assert!(doc.output_artifact.is_none());
}

/// Control-plane reads surface recovery logs for a workflow.
#[tokio::test]
async fn recovery_logs_are_queryable_per_workflow() {
    use cinder_flow::log::LogFilter;

    let store = Arc::new(InMemoryStore::new());
    let orch = orchestrator(&store);

    let workflow = Workflow::new("logged");
    let workflow_id = workflow.id;
    store.insert_workflow(&workflow).await.unwrap();

    let a = task(workflow_id, "a", TaskType::search(), &[]);
    store.insert_task(&a).await.unwrap();

    let now = Utc::now();
    store
        .claim_task(&[TaskType::search()], &WorkerId::generate(), now)
        .await
        .unwrap()
        .unwrap();
    orch.tick(now + chrono::Duration::seconds(301)).await.unwrap();

    let recovery = store
        .recent_logs(
            &LogFilter::new()
                .for_workflow(workflow_id)
                .recovery_only()
                .with_limit(10),
        )
        .await
        .unwrap();
    assert_eq!(recovery.len(), 1);
    assert!(recovery[0].message.contains("Recovered task"));

    let tasks = store
        .list_tasks(
            &TaskFilter::new()
                .for_workflow(workflow_id)
                .with_status(TaskStatus::Pending),
        )
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
}
