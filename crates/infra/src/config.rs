//! Worker configuration loaded from environment variables.
//!
//! | variable | default |
//! |----------|---------|
//! | `DATABASE_URL` | none |
//! | `WORKFORGE_WORKER_ID` | `worker-<uuid>` |
//! | `WORKFORGE_LEASE_SECS` | `300` |
//! | `WORKFORGE_POLL_MS` | `1000` |
//! | `WORKFORGE_MAX_IDLE_MS` | `30000` |
//! | `WORKFORGE_BATCH_SIZE` | `16` |
//! | `WORKFORGE_DB_MAX_CONNECTIONS` | `5` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use workforge_core::WorkerId;

use crate::queue::DispatcherConfig;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),
    #[error("{name}: invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    pub worker_id: WorkerId,
    pub lease_duration: Duration,
    pub poll_interval: Duration,
    pub max_idle: Duration,
    pub batch_size: usize,
    pub db_max_connections: u32,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let worker_id = match get("WORKFORGE_WORKER_ID") {
            Some(value) => WorkerId::new(value.clone()).map_err(|e| ConfigError::Invalid {
                name: "WORKFORGE_WORKER_ID",
                value,
                reason: e.to_string(),
            })?,
            None => WorkerId::generate(),
        };

        let lease_secs: u64 = parse(&get, "WORKFORGE_LEASE_SECS", 300)?;
        if lease_secs == 0 {
            return Err(ConfigError::Invalid {
                name: "WORKFORGE_LEASE_SECS",
                value: "0".to_string(),
                reason: "lease must be at least one second".to_string(),
            });
        }
        let poll_ms: u64 = parse(&get, "WORKFORGE_POLL_MS", 1_000)?;
        let max_idle_ms: u64 = parse(&get, "WORKFORGE_MAX_IDLE_MS", 30_000)?;
        let batch_size: usize = parse(&get, "WORKFORGE_BATCH_SIZE", 16)?;
        let db_max_connections: u32 = parse(&get, "WORKFORGE_DB_MAX_CONNECTIONS", 5)?;

        Ok(Self {
            database_url: get("DATABASE_URL"),
            worker_id,
            lease_duration: Duration::from_secs(lease_secs),
            poll_interval: Duration::from_millis(poll_ms.max(1)),
            max_idle: Duration::from_millis(max_idle_ms.max(poll_ms)),
            batch_size: batch_size.max(1),
            db_max_connections: db_max_connections.max(1),
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::default()
            .with_name(self.worker_id.as_str())
            .with_worker_id(self.worker_id.clone())
            .with_lease_duration(self.lease_duration)
            .with_poll_interval(self.poll_interval)
            .with_max_idle(self.max_idle)
            .with_batch_size(self.batch_size)
    }
}

fn parse<T>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match get(name) {
        None => Ok(default),
        Some(value) => {
            let parsed = value.trim().parse::<T>();
            parsed.map_err(|e| ConfigError::Invalid {
                name,
                reason: e.to_string(),
                value,
            })
        }
    }
}
