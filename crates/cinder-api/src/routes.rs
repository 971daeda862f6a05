//! Control-plane routes.
//!
//! | route | operation |
//! |---|---|
//! | `GET /health` | liveness |
//! | `GET /workers` | list worker registrations |
//! | `GET /workflows` | list workflows |
//! | `GET /workflows/{id}` | one workflow |
//! | `POST /workflows` | create a workflow and its seed PLAN task |
//! | `GET /tasks` | list tasks, filterable by workflow and status |
//! | `POST /tasks` | direct task insert |
//! | `GET /logs` | recent log events, most recent first |
//! | `POST /admin/kill` | terminate the supervised orchestrator |

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cinder_core::{TaskId, WorkflowId};
use cinder_flow::log::{LogEvent, LogFilter, LogLevel};
use cinder_flow::store::TaskFilter;
use cinder_flow::task::{InputContext, TaskDocument, TaskStatus, TaskType};
use cinder_flow::worker::WorkerRegistration;
use cinder_flow::workflow::Workflow;

use crate::error::ApiError;
use crate::state::AppState;

const COMPONENT: &str = "api";

/// Default number of log events returned when the query omits a limit.
const DEFAULT_LOG_LIMIT: usize = 100;

/// Builds the control-plane router.
#[must_use]
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/workers", get(list_workers))
        .route("/workflows", get(list_workflows).post(submit_workflow))
        .route("/workflows/{id}", get(get_workflow))
        .route("/tasks", get(list_tasks).post(submit_task))
        .route("/logs", get(get_logs))
        .route("/admin/kill", post(kill_orchestrator))
        .with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn list_workers(
    State(state): State<AppState>,
) -> Result<Json<Vec<WorkerRegistration>>, ApiError> {
    Ok(Json(state.store.list_workers().await?))
}

async fn list_workflows(State(state): State<AppState>) -> Result<Json<Vec<Workflow>>, ApiError> {
    Ok(Json(state.store.list_workflows(false).await?))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<WorkflowId>,
) -> Result<Json<Workflow>, ApiError> {
    state
        .store
        .get_workflow(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("workflow not found: {id}")))
}

/// Request body for `POST /workflows`.
#[derive(Debug, Deserialize)]
pub struct SubmitWorkflowRequest {
    /// The user goal to plan and execute.
    pub goal: String,
}

/// Response body for `POST /workflows`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SubmitWorkflowResponse {
    /// The created workflow.
    pub workflow_id: WorkflowId,
    /// The seed PLAN task that will materialize the DAG.
    pub plan_task_id: TaskId,
}

/// Creates a workflow and seeds it with a single PLAN task carrying the
/// goal. Everything after that (planning, execution, aggregation) happens
/// through the engine loops.
async fn submit_workflow(
    State(state): State<AppState>,
    Json(request): Json<SubmitWorkflowRequest>,
) -> Result<(StatusCode, Json<SubmitWorkflowResponse>), ApiError> {
    if request.goal.trim().is_empty() {
        return Err(ApiError::bad_request("goal must not be empty"));
    }

    let workflow = Workflow::new(request.goal.clone());
    state.store.insert_workflow(&workflow).await?;

    let plan_task = TaskDocument::new(
        TaskId::child_of(&workflow.id, "plan"),
        workflow.id,
        TaskType::plan(),
        vec![],
    )
    .with_max_retries(state.max_retries_default)
    .with_input_context(InputContext::with_goal(request.goal));
    state.store.insert_task(&plan_task).await?;

    cinder_flow::log::record(
        state.store.as_ref(),
        LogEvent::info(COMPONENT, format!("Workflow {} submitted", workflow.id))
            .with_workflow(workflow.id),
    )
    .await;

    Ok((
        StatusCode::CREATED,
        Json(SubmitWorkflowResponse {
            workflow_id: workflow.id,
            plan_task_id: plan_task.id,
        }),
    ))
}

/// Query parameters for `GET /tasks`.
#[derive(Debug, Default, Deserialize)]
pub struct TaskListParams {
    /// Restrict to one workflow.
    pub workflow_id: Option<WorkflowId>,
    /// Restrict to one status.
    pub status: Option<TaskStatus>,
}

async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskListParams>,
) -> Result<Json<Vec<TaskDocument>>, ApiError> {
    let mut filter = TaskFilter::new();
    if let Some(workflow_id) = params.workflow_id {
        filter = filter.for_workflow(workflow_id);
    }
    if let Some(status) = params.status {
        filter = filter.with_status(status);
    }
    Ok(Json(state.store.list_tasks(&filter).await?))
}

/// Request body for `POST /tasks`.
#[derive(Debug, Deserialize)]
pub struct SubmitTaskRequest {
    /// Task id; defaults to `<workflow_id>_<local_id>` when `local_id`
    /// is used instead.
    pub id: Option<TaskId>,
    /// Workflow-local id, qualified with the workflow prefix on insert.
    pub local_id: Option<String>,
    /// Owning workflow.
    pub workflow_id: WorkflowId,
    /// Task type tag.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Dependency task ids (fully qualified).
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    /// Handler input payload.
    #[serde(default)]
    pub input_context: InputContext,
    /// Retry budget; engine default when omitted.
    pub max_retries: Option<u32>,
}

async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<TaskDocument>), ApiError> {
    let id = match (request.id, request.local_id) {
        (Some(id), _) => id,
        (None, Some(local_id)) => TaskId::child_of(&request.workflow_id, &local_id),
        (None, None) => {
            return Err(ApiError::bad_request("either id or local_id is required"));
        }
    };

    if !id.belongs_to(&request.workflow_id) {
        return Err(ApiError::bad_request(format!(
            "task id '{id}' is not prefixed with workflow id '{}'",
            request.workflow_id
        )));
    }
    for dep in &request.dependencies {
        if !dep.belongs_to(&request.workflow_id) {
            return Err(ApiError::bad_request(format!(
                "dependency '{dep}' is outside workflow '{}'",
                request.workflow_id
            )));
        }
    }

    let task = TaskDocument::new(
        id,
        request.workflow_id,
        request.task_type,
        request.dependencies,
    )
    .with_max_retries(request.max_retries.unwrap_or(state.max_retries_default))
    .with_input_context(request.input_context);

    state.store.insert_task(&task).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

/// Query parameters for `GET /logs`.
#[derive(Debug, Default, Deserialize)]
pub struct LogListParams {
    /// Restrict to one workflow.
    pub workflow_id: Option<WorkflowId>,
    /// Restrict to recovery events (reclaims, retries, resurrections).
    #[serde(default)]
    pub recovery_only: bool,
    /// Maximum events returned; defaults to 100.
    pub limit: Option<usize>,
}

async fn get_logs(
    State(state): State<AppState>,
    Query(params): Query<LogListParams>,
) -> Result<Json<Vec<LogEvent>>, ApiError> {
    let mut filter = LogFilter::new().with_limit(params.limit.unwrap_or(DEFAULT_LOG_LIMIT));
    if let Some(workflow_id) = params.workflow_id {
        filter = filter.for_workflow(workflow_id);
    }
    if params.recovery_only {
        filter = filter.recovery_only();
    }
    Ok(Json(state.store.recent_logs(&filter).await?))
}

/// Response body for `POST /admin/kill`.
#[derive(Debug, Serialize, Deserialize)]
pub struct KillResponse {
    /// Whether the kill signal was dispatched.
    pub killed: bool,
    /// When the signal fired.
    pub timestamp: DateTime<Utc>,
}

/// Terminates the supervised orchestrator; the watchdog restarts it.
async fn kill_orchestrator(State(state): State<AppState>) -> Result<Json<KillResponse>, ApiError> {
    cinder_flow::log::record(
        state.store.as_ref(),
        LogEvent::new(
            LogLevel::Warn,
            COMPONENT,
            "Kill switch activated - terminating orchestrator",
        ),
    )
    .await;

    state.kill.fire();
    Ok(Json(KillResponse {
        killed: true,
        timestamp: Utc::now(),
    }))
}
