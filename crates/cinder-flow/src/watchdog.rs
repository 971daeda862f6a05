//! Orchestrator supervision.
//!
//! The orchestrator maintains a singleton heartbeat document in the store;
//! the watchdog monitors that heartbeat plus the orchestrator's own
//! liveness and restarts it when either goes quiet. The watchdog has zero
//! knowledge of workflow semantics; it only cares about process health.
//!
//! A [`KillSwitch`] lets the control plane terminate the supervised
//! orchestrator on demand, exercising recovery end to end.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::error::Result;
use crate::log::{self, LogEvent};
use crate::store::Store;

const COMPONENT: &str = "watchdog";

/// Liveness of the orchestrator heartbeat document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HeartbeatStatus {
    /// The orchestrator is ticking.
    Running,
    /// The watchdog is restarting the orchestrator.
    Restarting,
}

/// The singleton heartbeat document the orchestrator maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorHeartbeat {
    /// Heartbeat state.
    pub status: HeartbeatStatus,
    /// Last tick timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Times the watchdog has restarted the orchestrator.
    #[serde(default)]
    pub restarts: u32,
}

impl Default for OrchestratorHeartbeat {
    fn default() -> Self {
        Self {
            status: HeartbeatStatus::Running,
            last_heartbeat: None,
            restarts: 0,
        }
    }
}

/// Reads the orchestrator heartbeat to decide whether it is alive.
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor<S> {
    store: Arc<S>,
    timeout: Duration,
}

impl<S> HeartbeatMonitor<S>
where
    S: Store,
{
    /// Creates a monitor with the given staleness timeout.
    #[must_use]
    pub fn new(store: Arc<S>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Returns true if the orchestrator heartbeat is fresh at `now`.
    ///
    /// A missing heartbeat document, or one that never recorded a tick,
    /// counts as dead.
    ///
    /// # Errors
    ///
    /// Returns an error if the store read fails.
    pub async fn is_orchestrator_alive(&self, now: DateTime<Utc>) -> Result<bool> {
        let Some(heartbeat) = self.store.get_orchestrator_heartbeat().await? else {
            return Ok(false);
        };
        let Some(last_heartbeat) = heartbeat.last_heartbeat else {
            return Ok(false);
        };

        let timeout = chrono::Duration::from_std(self.timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        Ok(now.signed_duration_since(last_heartbeat) < timeout)
    }
}

/// Control-plane trigger that terminates the supervised orchestrator.
///
/// Firing the switch aborts the current orchestrator task; the watchdog
/// then restarts it through its normal recovery path.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch {
    notify: Arc<Notify>,
}

impl KillSwitch {
    /// Creates a new kill switch.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the switch.
    pub fn fire(&self) {
        self.notify.notify_one();
    }

    /// Resolves when the switch fires.
    pub async fn triggered(&self) {
        self.notify.notified().await;
    }
}

/// Watchdog configuration.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Interval between liveness checks.
    pub check_interval: Duration,
    /// Heartbeat age beyond which the orchestrator counts as dead.
    pub heartbeat_timeout: Duration,
    /// Restart attempts before the watchdog gives up.
    pub max_restarts: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(30),
            max_restarts: 10,
        }
    }
}

/// Monitors and restarts the orchestrator.
pub struct Watchdog<S> {
    store: Arc<S>,
    monitor: HeartbeatMonitor<S>,
    config: WatchdogConfig,
}

impl<S> Watchdog<S>
where
    S: Store + 'static,
{
    /// Creates a watchdog over a store.
    #[must_use]
    pub fn new(store: Arc<S>, config: WatchdogConfig) -> Self {
        let monitor = HeartbeatMonitor::new(Arc::clone(&store), config.heartbeat_timeout);
        Self {
            store,
            monitor,
            config,
        }
    }

    /// Supervises an orchestrator until shutdown or restart exhaustion.
    ///
    /// `spawn_orchestrator` produces a fresh orchestrator task; the
    /// watchdog spawns one immediately and thereafter checks every
    /// `check_interval` for a stale heartbeat (orchestrator frozen or
    /// partitioned) or a finished task (orchestrator crashed), restarting
    /// on either. Restarts beyond `max_restarts` make the watchdog give
    /// up and return.
    pub async fn supervise<F>(
        &self,
        spawn_orchestrator: F,
        kill: KillSwitch,
        mut shutdown: watch::Receiver<bool>,
    ) where
        F: Fn() -> JoinHandle<()>,
    {
        log::record(
            self.store.as_ref(),
            LogEvent::info(COMPONENT, "Watchdog started, supervising orchestrator"),
        )
        .await;

        let mut child = spawn_orchestrator();
        let mut restarts: u32 = 0;

        loop {
            let mut force_restart = false;

            tokio::select! {
                () = tokio::time::sleep(self.config.check_interval) => {}
                () = kill.triggered() => {
                    log::record(
                        self.store.as_ref(),
                        LogEvent::warn(
                            COMPONENT,
                            "Kill switch activated, terminating orchestrator",
                        ),
                    )
                    .await;
                    child.abort();
                    force_restart = true;
                }
                _ = shutdown.changed() => {}
            }

            if *shutdown.borrow() {
                child.abort();
                break;
            }

            let alive = match self.monitor.is_orchestrator_alive(Utc::now()).await {
                Ok(alive) => alive,
                Err(err) => {
                    tracing::warn!(error = %err, "heartbeat check failed");
                    continue;
                }
            };

            if !force_restart && alive && !child.is_finished() {
                continue;
            }

            if restarts >= self.config.max_restarts {
                log::record(
                    self.store.as_ref(),
                    LogEvent::error(COMPONENT, "Max restart attempts reached, giving up"),
                )
                .await;
                child.abort();
                break;
            }

            child.abort();
            restarts += 1;
            let total = match self.store.record_orchestrator_restart().await {
                Ok(total) => total,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to record restart");
                    restarts
                }
            };

            log::record(
                self.store.as_ref(),
                LogEvent::warn(
                    COMPONENT,
                    format!("Recovering orchestrator: restart #{total}"),
                ),
            )
            .await;

            child = spawn_orchestrator();
        }

        tracing::info!("watchdog stopped");
    }
}

impl<S> std::fmt::Debug for Watchdog<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
