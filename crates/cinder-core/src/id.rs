//! Strongly-typed identifiers for cinder entities.
//!
//! Workflow and worker identifiers are ULIDs:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! Task identifiers are strings of the form `<workflow_id>_<local_id>`, so a
//! task id always carries the workflow it belongs to.
//!
//! # Example
//!
//! ```rust
//! use cinder_core::id::{TaskId, WorkflowId};
//!
//! let workflow = WorkflowId::generate();
//! let task = TaskId::child_of(&workflow, "search");
//! assert!(task.belongs_to(&workflow));
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// A unique identifier for a workflow.
///
/// One workflow is created per user goal and owns the DAG of tasks the
/// planner materializes for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkflowId(Ulid);

impl WorkflowId {
    /// Generates a new unique workflow ID.
    ///
    /// Uses ULID generation which is:
    /// - Lexicographically sortable by creation time
    /// - Globally unique without coordination
    /// - URL-safe and case-insensitive
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a workflow ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkflowId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid workflow ID '{s}': {e}"),
            })
    }
}

/// A unique identifier for a worker process.
///
/// Workers are long-lived polling loops; a stable worker ID survives
/// restarts when configured explicitly, otherwise a fresh one is generated
/// per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Ulid);

impl WorkerId {
    /// Generates a new unique worker ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Ulid::new())
    }

    /// Creates a worker ID from a raw ULID.
    #[must_use]
    pub const fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid)
    }

    /// Returns the underlying ULID.
    #[must_use]
    pub const fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WorkerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_string(s)
            .map(Self)
            .map_err(|e| Error::InvalidId {
                message: format!("invalid worker ID '{s}': {e}"),
            })
    }
}

/// A unique identifier for a task.
///
/// Task ids follow the convention `<workflow_id>_<local_id>`, where the
/// local id is chosen by the planner. The prefix makes workflow membership
/// checkable without a store round-trip and gives ids a stable sort order
/// within a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Wraps a raw task id.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Builds the conventional id for a task local to a workflow.
    #[must_use]
    pub fn child_of(workflow: &WorkflowId, local_id: &str) -> Self {
        Self(format!("{workflow}_{local_id}"))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true if this id carries the given workflow's prefix.
    #[must_use]
    pub fn belongs_to(&self, workflow: &WorkflowId) -> bool {
        self.0
            .strip_prefix(&workflow.to_string())
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Returns the planner-chosen local part of the id, if the id follows
    /// the `<workflow_id>_<local_id>` convention for the given workflow.
    #[must_use]
    pub fn local_part(&self, workflow: &WorkflowId) -> Option<&str> {
        self.0
            .strip_prefix(&workflow.to_string())
            .and_then(|rest| rest.strip_prefix('_'))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for TaskId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}
