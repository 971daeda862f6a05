//! The planning handler.
//!
//! Planning is itself a task: a worker with the PLAN task type claims a
//! PLAN task, decomposes its goal into a set of child task blueprints, and
//! inserts the children into the store. The planner is the only component
//! that materializes DAGs, so it alone is responsible for acyclicity; the
//! orchestrator never verifies it.
//!
//! The decomposition source (typically a language model) sits behind the
//! [`GoalPlanner`] trait; this module owns everything around it: blueprint
//! validation, the topological cycle check before any insertion, child
//! document construction, and the plan-metadata artifact.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use cinder_core::{TaskId, WorkflowId};

use crate::dag::Dag;
use crate::error::Error;
use crate::handler::{HandlerContext, HandlerError, HandlerResult, TaskHandler};
use crate::log::{self, LogEvent};
use crate::task::{InputContext, TaskDocument, TaskType, DEFAULT_MAX_RETRIES};

const COMPONENT: &str = "planner";

/// One child task in a decomposition, before ids are qualified with the
/// workflow prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBlueprint {
    /// Workflow-local identifier; the stored id becomes
    /// `<workflow_id>_<local_id>`.
    pub local_id: String,
    /// Tag routing the task to capable workers.
    pub task_type: TaskType,
    /// Local ids of tasks in this same plan that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Submitter-defined payload fields for the child's input context.
    #[serde(default)]
    pub input: serde_json::Map<String, Value>,
    /// Overrides the workflow default when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskBlueprint {
    /// Creates a blueprint with no dependencies and no payload.
    #[must_use]
    pub fn new(local_id: impl Into<String>, task_type: TaskType) -> Self {
        Self {
            local_id: local_id.into(),
            task_type,
            dependencies: Vec::new(),
            input: serde_json::Map::new(),
            max_retries: None,
        }
    }

    /// Adds a dependency on another task in the same plan.
    #[must_use]
    pub fn depends_on(mut self, local_id: impl Into<String>) -> Self {
        self.dependencies.push(local_id.into());
        self
    }
}

/// A decomposition of one goal into child tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plan {
    /// The child tasks to insert.
    pub tasks: Vec<TaskBlueprint>,
}

impl Plan {
    /// Creates an empty plan.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a blueprint to the plan.
    #[must_use]
    pub fn with_task(mut self, task: TaskBlueprint) -> Self {
        self.tasks.push(task);
        self
    }

    /// Validates the plan and returns its local ids in topological order.
    ///
    /// Checks, in order:
    /// - at least one task
    /// - local ids are unique
    /// - every dependency references a local id within this plan
    /// - the dependency graph is acyclic
    ///
    /// # Errors
    ///
    /// Returns [`Error::PlanInvalid`] or [`Error::CycleDetected`].
    pub fn validate(&self) -> crate::error::Result<Vec<String>> {
        if self.tasks.is_empty() {
            return Err(Error::PlanInvalid {
                message: "plan contains no tasks".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.local_id.as_str()) {
                return Err(Error::PlanInvalid {
                    message: format!("duplicate task local id '{}'", task.local_id),
                });
            }
        }

        let mut dag: Dag<String> = Dag::new();
        for task in &self.tasks {
            dag.add_node(task.local_id.clone());
        }
        for task in &self.tasks {
            let Some(to) = dag.get_index(&task.local_id) else {
                return Err(Error::PlanInvalid {
                    message: format!("task '{}' missing from plan graph", task.local_id),
                });
            };
            for dep in &task.dependencies {
                let Some(from) = dag.get_index(dep) else {
                    return Err(Error::PlanInvalid {
                        message: format!(
                            "task '{}' depends on unknown task '{dep}'",
                            task.local_id
                        ),
                    });
                };
                dag.add_edge(from, to);
            }
        }

        dag.toposort()
    }
}

/// Plan metadata stored as the PLAN task's artifact, so downstream
/// observers can inspect what was planned.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanMetadata {
    /// Ids of the inserted child tasks, in insertion (topological) order.
    pub created_task_ids: Vec<TaskId>,
    /// Dependency edges as `(from, to)` child task id pairs.
    pub edges: Vec<(TaskId, TaskId)>,
}

/// Source of goal decompositions.
///
/// The production implementation calls a language model and parses its
/// output; that logic is outside the scheduling substrate. Implementations
/// raise [`HandlerError`] when decomposition fails (e.g. unparseable model
/// output), which sends the PLAN task through normal retry handling.
#[async_trait]
pub trait GoalPlanner: Send + Sync {
    /// Decomposes a goal into a plan.
    async fn decompose(&self, goal: &str) -> Result<Plan, HandlerError>;
}

/// A planner that returns a fixed plan regardless of goal.
#[derive(Debug, Clone)]
pub struct StaticPlanner {
    plan: Plan,
}

impl StaticPlanner {
    /// Creates a planner that always yields the given plan.
    #[must_use]
    pub const fn new(plan: Plan) -> Self {
        Self { plan }
    }
}

#[async_trait]
impl GoalPlanner for StaticPlanner {
    async fn decompose(&self, _goal: &str) -> Result<Plan, HandlerError> {
        Ok(self.plan.clone())
    }
}

/// The handler behind the PLAN task type.
///
/// Contract:
/// - child ids are prefixed with `<workflow_id>_` and dependencies refer to
///   ids from the same plan
/// - children with dependencies insert BLOCKED, the rest PENDING; retry
///   accounting starts fresh
/// - the produced graph is verified acyclic by a topological pass before
///   any insertion
/// - children never depend on the PLAN task itself
/// - the PLAN task's own artifact is the plan metadata
pub struct PlanHandler {
    planner: Arc<dyn GoalPlanner>,
    max_retries_default: u32,
}

impl PlanHandler {
    /// Creates a plan handler over a decomposition source.
    #[must_use]
    pub fn new(planner: Arc<dyn GoalPlanner>) -> Self {
        Self {
            planner,
            max_retries_default: DEFAULT_MAX_RETRIES,
        }
    }

    /// Sets the default `max_retries` stamped on child tasks.
    #[must_use]
    pub const fn with_max_retries_default(mut self, max_retries: u32) -> Self {
        self.max_retries_default = max_retries;
        self
    }

    fn build_child(
        &self,
        workflow_id: WorkflowId,
        blueprint: &TaskBlueprint,
    ) -> TaskDocument {
        let dependencies = blueprint
            .dependencies
            .iter()
            .map(|dep| TaskId::child_of(&workflow_id, dep))
            .collect();

        let input_context = InputContext {
            goal: None,
            dependency_outputs: std::collections::BTreeMap::new(),
            extra: blueprint.input.clone(),
        };

        TaskDocument::new(
            TaskId::child_of(&workflow_id, &blueprint.local_id),
            workflow_id,
            blueprint.task_type.clone(),
            dependencies,
        )
        .with_max_retries(blueprint.max_retries.unwrap_or(self.max_retries_default))
        .with_input_context(input_context)
    }
}

#[async_trait]
impl TaskHandler for PlanHandler {
    async fn execute(&self, ctx: &HandlerContext, task: &TaskDocument) -> HandlerResult {
        let goal = task
            .input_context
            .goal
            .as_deref()
            .ok_or_else(|| HandlerError::new("PLAN task has no goal in its input context"))?;

        let plan = self.planner.decompose(goal).await?;

        let order = plan
            .validate()
            .map_err(|err| HandlerError::new(err.to_string()))?;

        // The plan task itself must stay disjoint from its children: a
        // colliding local id would make the duplicate-insert skip below
        // silently alias the plan task.
        if let Some(own_local) = task.id.local_part(&task.workflow_id) {
            if order.iter().any(|local| local == own_local) {
                return Err(HandlerError::new(format!(
                    "plan produced a task colliding with the plan task id '{own_local}'"
                )));
            }
        }

        let mut created = Vec::with_capacity(order.len());
        let mut edges = Vec::new();

        for local_id in &order {
            let blueprint = plan
                .tasks
                .iter()
                .find(|t| &t.local_id == local_id)
                .ok_or_else(|| HandlerError::new("validated plan lost a task"))?;

            let child = self.build_child(task.workflow_id, blueprint);
            for dep in &child.dependencies {
                edges.push((dep.clone(), child.id.clone()));
            }

            match ctx.store.insert_task(&child).await {
                Ok(()) => created.push(child.id),
                // A retried PLAN handler re-inserts children it already
                // planned; that is success, not a conflict.
                Err(err) if err.is_duplicate_id() => created.push(child.id),
                Err(err) => return Err(HandlerError::new(err.to_string())),
            }
        }

        log::record(
            ctx.store.as_ref(),
            LogEvent::info(
                COMPONENT,
                format!("Planned {} tasks for goal '{goal}'", created.len()),
            )
            .with_workflow(task.workflow_id)
            .with_task(task.id.clone()),
        )
        .await;

        let metadata = PlanMetadata {
            created_task_ids: created,
            edges,
        };
        serde_json::to_value(&metadata)
            .map_err(|err| HandlerError::new(format!("failed to serialize plan metadata: {err}")))
    }
}
