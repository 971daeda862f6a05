//! Observability metrics for the scheduling substrate.
//!
//! Exposed through the `metrics` crate facade so deployments can install
//! any compatible recorder (e.g. a Prometheus exporter).
//!
//! ## Metrics Exported
//!
//! | Metric | Type | Labels | Description |
//! |--------|------|--------|-------------|
//! | `cinder_flow_claims_total` | Counter | `task_type` | Successful atomic claims |
//! | `cinder_flow_completions_total` | Counter | `task_type` | Tasks completed |
//! | `cinder_flow_retries_total` | Counter | `task_type` | Tasks released for retry |
//! | `cinder_flow_failures_total` | Counter | `task_type` | Tasks failed terminally |
//! | `cinder_flow_reclaims_total` | Counter | - | Expired leases reclaimed |
//! | `cinder_flow_tick_duration_seconds` | Histogram | `component` | Worker/orchestrator tick time |
//! | `cinder_flow_workflows_total` | Counter | `status` | Workflow terminal transitions |

use std::time::Instant;

use metrics::{counter, histogram};

/// Metric names as constants for consistency.
pub mod names {
    /// Counter: Successful atomic claims.
    pub const CLAIMS_TOTAL: &str = "cinder_flow_claims_total";
    /// Counter: Tasks completed.
    pub const COMPLETIONS_TOTAL: &str = "cinder_flow_completions_total";
    /// Counter: Tasks released for retry.
    pub const RETRIES_TOTAL: &str = "cinder_flow_retries_total";
    /// Counter: Tasks failed terminally.
    pub const FAILURES_TOTAL: &str = "cinder_flow_failures_total";
    /// Counter: Expired leases reclaimed by the orchestrator.
    pub const RECLAIMS_TOTAL: &str = "cinder_flow_reclaims_total";
    /// Histogram: Tick processing time in seconds.
    pub const TICK_DURATION_SECONDS: &str = "cinder_flow_tick_duration_seconds";
    /// Counter: Workflow terminal transitions.
    pub const WORKFLOWS_TOTAL: &str = "cinder_flow_workflows_total";
}

/// Label keys used across metrics.
pub mod labels {
    /// Task type tag.
    pub const TASK_TYPE: &str = "task_type";
    /// Emitting component (worker, orchestrator).
    pub const COMPONENT: &str = "component";
    /// Workflow status label.
    pub const STATUS: &str = "status";
}

/// Recorder for substrate metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetrics;

impl FlowMetrics {
    /// Creates a new metrics recorder.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Records a successful atomic claim.
    pub fn record_claim(&self, task_type: &str) {
        counter!(names::CLAIMS_TOTAL, labels::TASK_TYPE => task_type.to_string()).increment(1);
    }

    /// Records a task completion.
    pub fn record_completion(&self, task_type: &str) {
        counter!(names::COMPLETIONS_TOTAL, labels::TASK_TYPE => task_type.to_string()).increment(1);
    }

    /// Records a retry release.
    pub fn record_retry(&self, task_type: &str) {
        counter!(names::RETRIES_TOTAL, labels::TASK_TYPE => task_type.to_string()).increment(1);
    }

    /// Records a terminal task failure.
    pub fn record_failure(&self, task_type: &str) {
        counter!(names::FAILURES_TOTAL, labels::TASK_TYPE => task_type.to_string()).increment(1);
    }

    /// Records an expired-lease reclamation.
    pub fn record_reclaim(&self) {
        counter!(names::RECLAIMS_TOTAL).increment(1);
    }

    /// Records a workflow reaching a terminal status.
    pub fn record_workflow_terminal(&self, status: &str) {
        counter!(names::WORKFLOWS_TOTAL, labels::STATUS => status.to_string()).increment(1);
    }

    /// Starts a tick timer for a component.
    #[must_use]
    pub fn start_tick(&self, component: &'static str) -> TickTimer {
        TickTimer {
            component,
            started: Instant::now(),
        }
    }
}

/// Measures one tick and records its duration on drop.
#[derive(Debug)]
pub struct TickTimer {
    component: &'static str,
    started: Instant,
}

impl Drop for TickTimer {
    fn drop(&mut self) {
        histogram!(
            names::TICK_DURATION_SECONDS,
            labels::COMPONENT => self.component,
        )
        .record(self.started.elapsed().as_secs_f64());
    }
}
