//! Observability infrastructure for cinder.
//!
//! Structured logging with consistent spans. This module provides
//! initialization helpers and span constructors so every component
//! (workers, orchestrator, control plane) logs the same way.

use std::sync::Once;
use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Log output format.
#[derive(Debug, Clone, Copy, Default)]
pub enum LogFormat {
    /// JSON structured logs (for production).
    Json,
    /// Pretty-printed logs (for development).
    #[default]
    Pretty,
}

impl LogFormat {
    /// Resolves the format from the `CINDER_LOG_FORMAT` environment variable.
    #[must_use]
    pub fn from_env() -> Self {
        match std::env::var("CINDER_LOG_FORMAT") {
            Ok(value) if value.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Pretty,
        }
    }
}

/// Initializes the logging subsystem.
///
/// Call once at application startup. Safe to call multiple times;
/// subsequent calls are no-ops.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Controls log levels (e.g., `info`, `cinder_flow=debug`)
///
/// # Example
///
/// ```rust
/// use cinder_core::observability::{init_logging, LogFormat};
///
/// init_logging(LogFormat::Pretty);
/// ```
pub fn init_logging(format: LogFormat) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match format {
            LogFormat::Json => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().json())
                    .init();
            }
            LogFormat::Pretty => {
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().pretty())
                    .init();
            }
        }
    });
}

/// Creates a span for worker operations with standard fields.
///
/// # Example
///
/// ```rust
/// use cinder_core::observability::worker_span;
///
/// let span = worker_span("claim", "01J3ZV4Q2W8N1XKJ5T0R9DQ6FP");
/// let _guard = span.enter();
/// // ... do worker operation
/// ```
#[must_use]
pub fn worker_span(operation: &str, worker_id: &str) -> Span {
    tracing::info_span!(
        "worker",
        op = operation,
        worker_id = worker_id,
    )
}

/// Creates a span for orchestrator operations.
#[must_use]
pub fn orchestrator_span(operation: &str) -> Span {
    tracing::info_span!("orchestrator", op = operation)
}

/// Creates a span for task execution scoped to a workflow.
#[must_use]
pub fn task_span(task_id: &str, workflow_id: &str, task_type: &str) -> Span {
    tracing::info_span!(
        "task",
        task_id = task_id,
        workflow_id = workflow_id,
        task_type = task_type,
    )
}
