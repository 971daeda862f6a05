//! # cinder-flow
//!
//! The distributed task-scheduling substrate of the cinder workflow engine.
//!
//! This crate implements the coordination core, providing:
//!
//! - **Atomic claims**: Mutually-blind workers pull exclusive ownership of
//!   ready tasks through single-document conditional updates
//! - **Dependency resolution**: Tasks unblock as their predecessors complete,
//!   with artifacts propagated along DAG edges
//! - **Lease recovery**: Tasks held by crashed workers are reclaimed after a
//!   configurable lease TTL
//! - **Planning**: A PLAN task handler materializes an acyclic task graph
//!   from a user goal
//!
//! ## Core Concepts
//!
//! - **Workflow**: One record per user goal, aggregated from its tasks
//! - **Task**: The unit of scheduling; owns its status, lock, retries, and artifact
//! - **Store**: The shared durable document store; every process is stateless
//!   and may be killed or restarted without losing progress
//!
//! ## Guarantees
//!
//! - **Exclusive claims**: At most one worker holds a task at a time
//! - **Dependency gating**: No task runs before all its dependencies complete
//! - **Crash safety**: Any process may die mid-operation; the next
//!   orchestrator tick or worker claim resumes the work
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use cinder_flow::error::Result;
//! use cinder_flow::handler::{HandlerRegistry, StaticHandler};
//! use cinder_flow::store::memory::InMemoryStore;
//! use cinder_flow::task::TaskType;
//! use cinder_flow::worker::{Worker, WorkerConfig};
//!
//! # fn main() -> Result<()> {
//! let store = Arc::new(InMemoryStore::new());
//! let registry = HandlerRegistry::new()
//!     .with_handler(TaskType::search(), Arc::new(StaticHandler::ok()));
//!
//! let _worker = Worker::new(store, Arc::new(registry), WorkerConfig::default());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

// Internal modules - not exposed in public API.
pub(crate) mod dag;

pub mod config;
pub mod error;
pub mod handler;
pub mod log;
pub mod metrics;
pub mod orchestrator;
pub mod planner;
pub mod store;
pub mod task;
pub mod watchdog;
pub mod worker;
pub mod workflow;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::{EngineConfig, WorkerSettings};
    pub use crate::error::{Error, Result};
    pub use crate::handler::{HandlerContext, HandlerError, HandlerRegistry, TaskHandler};
    pub use crate::log::{LogEvent, LogFilter, LogLevel};
    pub use crate::orchestrator::{Orchestrator, OrchestratorConfig, TickSummary};
    pub use crate::planner::{GoalPlanner, Plan, PlanHandler, TaskBlueprint};
    pub use crate::store::{CasResult, LeaseCheck, Store, TaskFilter};
    pub use crate::task::{TaskDocument, TaskStatus, TaskType};
    pub use crate::watchdog::{KillSwitch, Watchdog, WatchdogConfig};
    pub use crate::worker::{Worker, WorkerConfig, WorkerRegistration, WorkerStatus};
    pub use crate::workflow::{Workflow, WorkflowStatus};
}
