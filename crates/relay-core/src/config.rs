//! Runtime configuration
//!
//! All knobs come from the environment with sensible defaults, so the core
//! runs unconfigured in tests and picks up deployment settings in
//! production. `.env` files are honoured via dotenvy.

use std::collections::BTreeMap;
use std::env;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Configuration for the execution core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Postgres connection string; `None` selects the in-memory ledger.
    pub database_url: Option<String>,

    /// Worker count for the default lane.
    pub worker_pool_size: usize,

    /// Extra lanes and their worker counts, e.g. `ingestion=4,reports=2`.
    pub worker_lanes: BTreeMap<String, usize>,

    pub scheduler_interval_seconds: f64,
    pub scheduler_instance_id: String,

    pub default_max_retries: u32,
    pub default_retry_delay_seconds: u32,
    pub default_timeout_seconds: u32,

    pub dlq_auto_retry_enabled: bool,
    pub dlq_auto_retry_cadence_seconds: u64,

    /// Event bus backend; only `memory` is implemented.
    pub event_backend: String,

    /// Content cache backend: `none` or `memory`.
    pub cache_backend: String,

    pub data_retention_days: u32,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            worker_pool_size: 4,
            worker_lanes: BTreeMap::new(),
            scheduler_interval_seconds: 1.0,
            scheduler_instance_id: format!("relay-{}", uuid::Uuid::now_v7().simple()),
            default_max_retries: 3,
            default_retry_delay_seconds: 30,
            default_timeout_seconds: 300,
            dlq_auto_retry_enabled: false,
            dlq_auto_retry_cadence_seconds: 60,
            event_backend: "memory".to_string(),
            cache_backend: "memory".to_string(),
            data_retention_days: 90,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the environment (and `.env`, if present).
    pub fn from_env() -> Result<Self, CoreError> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let config = Self {
            database_url: env::var("DATABASE_URL").ok(),
            worker_pool_size: parse_var("RELAY_WORKER_POOL_SIZE", defaults.worker_pool_size)?,
            worker_lanes: parse_lanes(env::var("RELAY_WORKER_LANES").ok().as_deref())?,
            scheduler_interval_seconds: parse_var(
                "RELAY_SCHEDULER_INTERVAL_SECONDS",
                defaults.scheduler_interval_seconds,
            )?,
            scheduler_instance_id: env::var("RELAY_SCHEDULER_INSTANCE_ID")
                .unwrap_or(defaults.scheduler_instance_id),
            default_max_retries: parse_var(
                "RELAY_DEFAULT_MAX_RETRIES",
                defaults.default_max_retries,
            )?,
            default_retry_delay_seconds: parse_var(
                "RELAY_DEFAULT_RETRY_DELAY_SECONDS",
                defaults.default_retry_delay_seconds,
            )?,
            default_timeout_seconds: parse_var(
                "RELAY_DEFAULT_TIMEOUT_SECONDS",
                defaults.default_timeout_seconds,
            )?,
            dlq_auto_retry_enabled: parse_var(
                "RELAY_DLQ_AUTO_RETRY_ENABLED",
                defaults.dlq_auto_retry_enabled,
            )?,
            dlq_auto_retry_cadence_seconds: parse_var(
                "RELAY_DLQ_AUTO_RETRY_CADENCE_SECONDS",
                defaults.dlq_auto_retry_cadence_seconds,
            )?,
            event_backend: env::var("RELAY_EVENT_BACKEND").unwrap_or(defaults.event_backend),
            cache_backend: env::var("RELAY_CACHE_BACKEND").unwrap_or(defaults.cache_backend),
            data_retention_days: parse_var(
                "RELAY_DATA_RETENTION_DAYS",
                defaults.data_retention_days,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.worker_pool_size == 0 {
            return Err(CoreError::config("worker_pool_size must be positive"));
        }
        if self.scheduler_interval_seconds <= 0.0 {
            return Err(CoreError::config(
                "scheduler_interval_seconds must be positive",
            ));
        }
        if self.event_backend != "memory" {
            return Err(CoreError::config(format!(
                "unsupported event backend: {}",
                self.event_backend
            )));
        }
        if !matches!(self.cache_backend.as_str(), "none" | "memory") {
            return Err(CoreError::config(format!(
                "unsupported cache backend: {}",
                self.cache_backend
            )));
        }
        if let Some((lane, _)) = self.worker_lanes.iter().find(|(_, size)| **size == 0) {
            return Err(CoreError::config(format!(
                "lane '{lane}' must have a positive worker count"
            )));
        }
        Ok(())
    }

    /// Worker count for a lane, falling back to the default pool size.
    pub fn lane_size(&self, lane: &str) -> usize {
        self.worker_lanes
            .get(lane)
            .copied()
            .unwrap_or(self.worker_pool_size)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, default: T) -> Result<T, CoreError>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| CoreError::config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Parse `lane=size,lane=size` pairs.
fn parse_lanes(raw: Option<&str>) -> Result<BTreeMap<String, usize>, CoreError> {
    let mut lanes = BTreeMap::new();
    let Some(raw) = raw else {
        return Ok(lanes);
    };

    for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
        let (lane, size) = pair
            .split_once('=')
            .ok_or_else(|| CoreError::config(format!("invalid lane spec '{pair}'")))?;
        let size: usize = size
            .trim()
            .parse()
            .map_err(|e| CoreError::config(format!("invalid size for lane '{lane}': {e}")))?;
        lanes.insert(lane.trim().to_string(), size);
    }
    Ok(lanes)
}
