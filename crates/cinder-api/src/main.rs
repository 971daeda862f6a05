//! Single-node cinder server.
//!
//! Wires every component against one in-memory store: a watchdog-supervised
//! orchestrator, a pool of workers with reference handlers, and the HTTP
//! control plane. Multi-process deployments embed the library crates
//! against a shared document store instead; this binary is the reference
//! wiring and a complete playground for the scheduling substrate.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;

use cinder_api::{router, AppState};
use cinder_core::observability::{init_logging, LogFormat};
use cinder_flow::config::{parse_task_types, EngineConfig, WorkerSettings};
use cinder_flow::error::{Error, Result};
use cinder_flow::handler::{HandlerRegistry, StaticHandler};
use cinder_flow::orchestrator::{Orchestrator, OrchestratorConfig};
use cinder_flow::planner::{Plan, PlanHandler, StaticPlanner, TaskBlueprint};
use cinder_flow::store::memory::InMemoryStore;
use cinder_flow::store::Store;
use cinder_flow::task::TaskType;
use cinder_flow::watchdog::{KillSwitch, Watchdog, WatchdogConfig};
use cinder_flow::worker::{Worker, WorkerConfig};

/// The decomposition the reference planner emits for every goal: a
/// three-stage research pipeline. Real deployments implement
/// [`cinder_flow::planner::GoalPlanner`] over a language model.
fn reference_plan() -> Plan {
    Plan::new()
        .with_task(TaskBlueprint::new("search", TaskType::search()))
        .with_task(TaskBlueprint::new("analyze", TaskType::analyze()).depends_on("search"))
        .with_task(TaskBlueprint::new("synthesize", TaskType::synthesize()).depends_on("analyze"))
}

fn build_registry(task_types: &[TaskType], max_retries_default: u32) -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    for task_type in task_types {
        if *task_type == TaskType::plan() {
            registry.register(
                task_type.clone(),
                Arc::new(
                    PlanHandler::new(Arc::new(StaticPlanner::new(reference_plan())))
                        .with_max_retries_default(max_retries_default),
                ),
            );
        } else {
            registry.register(task_type.clone(), Arc::new(StaticHandler::ok()));
        }
    }
    registry
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn resolve_bind_addr() -> Result<SocketAddr> {
    let raw =
        optional_env("CINDER_BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".to_string());
    raw.parse()
        .map_err(|_| Error::configuration("invalid CINDER_BIND_ADDR"))
}

fn worker_count() -> Result<usize> {
    optional_env("CINDER_WORKERS").map_or(Ok(2), |raw| {
        raw.parse::<usize>()
            .map_err(|_| Error::configuration("invalid CINDER_WORKERS"))
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging(LogFormat::from_env());

    let store_uri = optional_env("CINDER_STORE_URI").unwrap_or_else(|| "memory://".to_string());
    if store_uri != "memory://" {
        return Err(Error::configuration(
            "cinder-server only ships the memory:// store; other stores plug in through the cinder-flow Store trait",
        ));
    }
    let mut config = EngineConfig::new(store_uri);
    config.apply_env_overrides()?;

    let settings = if std::env::var("CINDER_TASK_TYPES").is_ok() {
        WorkerSettings::from_env()?
    } else {
        WorkerSettings {
            worker_id: None,
            name: "worker".to_string(),
            task_types: parse_task_types("PLAN,SEARCH,ANALYZE,SYNTHESIZE")?,
        }
    };

    let store = Arc::new(InMemoryStore::new());
    let registry = Arc::new(build_registry(
        &settings.task_types,
        config.max_retries_default,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let kill = KillSwitch::new();

    // Workers: independent units of concurrency sharing nothing but the store.
    let mut joins = Vec::new();
    for i in 0..worker_count()? {
        let mut worker = Worker::new(
            Arc::clone(&store),
            Arc::clone(&registry),
            WorkerConfig {
                name: format!("{}-{i}", settings.name),
                poll_interval: config.poll_interval,
                backoff_on_error: config.backoff_on_error,
            },
        );
        // A pinned worker id only makes sense for a single worker.
        if i == 0 {
            if let Some(worker_id) = settings.worker_id {
                worker = worker.with_id(worker_id);
            }
        }
        let shutdown_rx = shutdown_rx.clone();
        joins.push(tokio::spawn(async move { worker.run(shutdown_rx).await }));
    }

    // The orchestrator runs under watchdog supervision; the kill switch is
    // shared with the control plane.
    let watchdog = Watchdog::new(Arc::clone(&store), WatchdogConfig::default());
    let orchestrator_config = OrchestratorConfig {
        poll_interval: config.poll_interval,
        lease_ttl: config.lease_ttl,
        backoff_on_error: config.backoff_on_error,
    };
    let watchdog_join = tokio::spawn({
        let store = Arc::clone(&store);
        let kill = kill.clone();
        let supervise_rx = shutdown_rx.clone();
        let child_rx = shutdown_rx.clone();
        async move {
            let factory = move || {
                let orchestrator =
                    Orchestrator::new(Arc::clone(&store), orchestrator_config.clone());
                let halt_rx = child_rx.clone();
                tokio::spawn(async move { orchestrator.run(halt_rx).await })
            };
            watchdog.supervise(factory, kill, supervise_rx).await;
        }
    });

    let state = AppState::new(
        Arc::clone(&store) as Arc<dyn Store>,
        kill,
        config.max_retries_default,
    );
    let app = router(state);

    let addr = resolve_bind_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::configuration(format!("failed to bind {addr}: {e}")))?;
    tracing::info!(%addr, "control plane listening");

    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });
    server
        .await
        .map_err(|e| Error::storage(format!("server error: {e}")))?;

    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    watchdog_join.await.ok();
    for join in joins {
        join.await.ok();
    }
    Ok(())
}
