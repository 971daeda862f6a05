//! Error types for the scheduling substrate.

use cinder_core::TaskId;

/// The result type used throughout cinder-flow.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in scheduling operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An insert collided with an existing document id.
    #[error("duplicate id: {id}")]
    DuplicateId {
        /// The id that already exists.
        id: String,
    },

    /// A task was not found in the store.
    #[error("task not found: {task_id}")]
    TaskNotFound {
        /// The task ID that was not found.
        task_id: TaskId,
    },

    /// A workflow was not found in the store.
    #[error("workflow not found: {workflow_id}")]
    WorkflowNotFound {
        /// The workflow ID that was not found.
        workflow_id: String,
    },

    /// An invalid state transition was attempted.
    #[error("invalid state transition: {from} -> {to} ({reason})")]
    InvalidStateTransition {
        /// The current state.
        from: String,
        /// The attempted target state.
        to: String,
        /// The reason the transition is invalid.
        reason: String,
    },

    /// A cycle was detected in a planned task graph.
    #[error("cycle detected in dependency graph: {cycle:?}")]
    CycleDetected {
        /// The cycle path (task local ids).
        cycle: Vec<String>,
    },

    /// A plan failed validation before insertion.
    #[error("invalid plan: {message}")]
    PlanInvalid {
        /// Description of the validation failure.
        message: String,
    },

    /// A storage operation failed.
    #[error("storage error: {message}")]
    Storage {
        /// Description of the storage failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A serialization error occurred.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A configuration value is missing or malformed.
    #[error("configuration error: {message}")]
    Configuration {
        /// Description of the configuration problem.
        message: String,
    },

    /// An error from cinder-core.
    #[error("core error: {0}")]
    Core(#[from] cinder_core::Error),
}

impl Error {
    /// Creates a new storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a new storage error with a source.
    #[must_use]
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates a new serialization error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Creates a new configuration error.
    #[must_use]
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Returns true if this error is a duplicate-id collision.
    ///
    /// Used by the planner to treat re-inserting an already-planned child
    /// task as success, so a retried PLAN handler is safe after a partial
    /// insertion.
    #[must_use]
    pub const fn is_duplicate_id(&self) -> bool {
        matches!(self, Self::DuplicateId { .. })
    }
}
