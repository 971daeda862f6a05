//! Engine configuration.
//!
//! Configuration is environment-driven in the binaries and plain structs in
//! the library, so embedders construct them directly and deployments load
//! them from `CINDER_*` variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use cinder_core::WorkerId;

use crate::error::{Error, Result};
use crate::task::{TaskType, DEFAULT_MAX_RETRIES};

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_lease_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_backoff_on_error() -> Duration {
    Duration::from_secs(5)
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

/// Engine-wide configuration shared by workers and the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Connection string to the durable store.
    pub store_uri: String,

    /// Tick between store scans.
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    /// Maximum IN_PROGRESS age before lease reclamation.
    #[serde(with = "humantime_serde", default = "default_lease_ttl")]
    pub lease_ttl: Duration,

    /// Default `max_retries` when a task omits it.
    #[serde(default = "default_max_retries")]
    pub max_retries_default: u32,

    /// Sleep on loop exceptions.
    #[serde(with = "humantime_serde", default = "default_backoff_on_error")]
    pub backoff_on_error: Duration,
}

impl EngineConfig {
    /// Creates a configuration with defaults for everything but the store URI.
    #[must_use]
    pub fn new(store_uri: impl Into<String>) -> Self {
        Self {
            store_uri: store_uri.into(),
            poll_interval: default_poll_interval(),
            lease_ttl: default_lease_ttl(),
            max_retries_default: default_max_retries(),
            backoff_on_error: default_backoff_on_error(),
        }
    }

    /// Loads the configuration from `CINDER_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `CINDER_STORE_URI` is missing or a numeric
    /// variable fails to parse.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(required_env("CINDER_STORE_URI")?);
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Applies the optional `CINDER_*` tuning variables over this
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric variable fails to parse.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(secs) = optional_secs("CINDER_POLL_INTERVAL_SECS")? {
            self.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_secs("CINDER_LEASE_TTL_SECS")? {
            self.lease_ttl = Duration::from_secs(secs);
        }
        if let Some(secs) = optional_secs("CINDER_BACKOFF_SECS")? {
            self.backoff_on_error = Duration::from_secs(secs);
        }
        if let Some(raw) = optional_env("CINDER_MAX_RETRIES") {
            self.max_retries_default = raw
                .parse::<u32>()
                .map_err(|_| Error::configuration("invalid CINDER_MAX_RETRIES"))?;
        }
        Ok(())
    }
}

/// Per-worker settings.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Stable identifier; a fresh one is generated per process when absent.
    pub worker_id: Option<WorkerId>,
    /// Human-readable name.
    pub name: String,
    /// Task types this worker claims.
    pub task_types: Vec<TaskType>,
}

impl WorkerSettings {
    /// Loads worker settings from `CINDER_*` environment variables.
    ///
    /// `CINDER_TASK_TYPES` is a required comma-separated list of tags;
    /// `CINDER_WORKER_ID` and `CINDER_WORKER_NAME` are optional.
    ///
    /// # Errors
    ///
    /// Returns an error if `CINDER_TASK_TYPES` is missing or empty, or if
    /// `CINDER_WORKER_ID` is not a valid identifier.
    pub fn from_env() -> Result<Self> {
        let task_types = parse_task_types(&required_env("CINDER_TASK_TYPES")?)?;

        let worker_id = optional_env("CINDER_WORKER_ID")
            .map(|raw| {
                raw.parse::<WorkerId>()
                    .map_err(|err| Error::configuration(err.to_string()))
            })
            .transpose()?;

        Ok(Self {
            worker_id,
            name: optional_env("CINDER_WORKER_NAME").unwrap_or_else(|| "worker".to_string()),
            task_types,
        })
    }
}

/// Parses a comma-separated task-type list.
///
/// # Errors
///
/// Returns an error if the list contains no tags.
pub fn parse_task_types(raw: &str) -> Result<Vec<TaskType>> {
    let task_types: Vec<TaskType> = raw
        .split(',')
        .map(str::trim)
        .filter(|tag| !tag.is_empty())
        .map(TaskType::new)
        .collect();

    if task_types.is_empty() {
        return Err(Error::configuration("task type list is empty"));
    }
    Ok(task_types)
}

fn required_env(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| Error::configuration(format!("missing {key}")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn optional_secs(key: &str) -> Result<Option<u64>> {
    optional_env(key)
        .map(|raw| {
            raw.parse::<u64>()
                .map_err(|_| Error::configuration(format!("invalid {key}")))
        })
        .transpose()
}
