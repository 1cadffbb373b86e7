//! Engine configuration
//!
//! Loaded from environment variables; every field has a default.

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{EngineError, EngineResult};
use crate::retry::BackoffStrategy;

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Distinct replica acks needed for quorum
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Retries granted to each command the engine schedules
    #[serde(default = "default_command_retry_max")]
    pub command_retry_max: u32,

    #[serde(default = "default_tick_interval_ms")]
    pub scheduler_tick_interval_ms: u64,

    /// Commands executing at once
    #[serde(default = "default_max_concurrency")]
    pub scheduler_max_concurrency: usize,

    /// Merkle worker threads started eagerly
    #[serde(default = "default_worker_pool_min")]
    pub worker_pool_min: usize,

    /// Upper bound the Merkle pool may grow to under load
    #[serde(default = "default_worker_pool_max")]
    pub worker_pool_max: usize,

    /// Deadline for an operation to reach a terminal status
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Timeout of each individual peer request
    #[serde(default = "default_network_request_timeout_ms")]
    pub network_request_timeout_ms: u64,

    #[serde(default)]
    pub backoff: BackoffStrategy,

    /// Interval of replica audits after a replication completes; disabled when unset
    #[serde(default)]
    pub replica_audit_interval_ms: Option<u64>,

    /// Sled data directory
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_replication_factor() -> u32 {
    3
}

fn default_command_retry_max() -> u32 {
    3
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_max_concurrency() -> usize {
    4
}

fn default_worker_pool_min() -> usize {
    1
}

fn default_worker_pool_max() -> usize {
    4
}

fn default_operation_timeout_ms() -> u64 {
    300_000
}

fn default_network_request_timeout_ms() -> u64 {
    15_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./dx_data")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            command_retry_max: default_command_retry_max(),
            scheduler_tick_interval_ms: default_tick_interval_ms(),
            scheduler_max_concurrency: default_max_concurrency(),
            worker_pool_min: default_worker_pool_min(),
            worker_pool_max: default_worker_pool_max(),
            operation_timeout_ms: default_operation_timeout_ms(),
            network_request_timeout_ms: default_network_request_timeout_ms(),
            backoff: BackoffStrategy::default(),
            replica_audit_interval_ms: None,
            data_dir: default_data_dir(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let retry_delay_ms: u64 = env_parse("COMMAND_RETRY_DELAY_MS").unwrap_or(1_000);
        let retry_max_delay_ms: u64 = env_parse("COMMAND_RETRY_MAX_DELAY_MS").unwrap_or(60_000);
        let backoff = match env::var("COMMAND_BACKOFF").map(|s| s.to_lowercase()) {
            Ok(kind) if kind == "fixed" => BackoffStrategy::Fixed {
                delay_ms: retry_delay_ms,
            },
            _ => BackoffStrategy::Exponential {
                initial_delay_ms: retry_delay_ms,
                max_delay_ms: retry_max_delay_ms,
                multiplier: 2.0,
            },
        };

        Self {
            replication_factor: env_parse("REPLICATION_FACTOR").unwrap_or(defaults.replication_factor),
            command_retry_max: env_parse("COMMAND_RETRY_MAX").unwrap_or(defaults.command_retry_max),
            scheduler_tick_interval_ms: env_parse("SCHEDULER_TICK_INTERVAL_MS")
                .unwrap_or(defaults.scheduler_tick_interval_ms),
            scheduler_max_concurrency: env_parse("SCHEDULER_MAX_CONCURRENCY")
                .unwrap_or(defaults.scheduler_max_concurrency),
            worker_pool_min: env_parse("WORKER_POOL_MIN").unwrap_or(defaults.worker_pool_min),
            worker_pool_max: env_parse("WORKER_POOL_MAX").unwrap_or(defaults.worker_pool_max),
            operation_timeout_ms: env_parse("OPERATION_TIMEOUT_MS").unwrap_or(defaults.operation_timeout_ms),
            network_request_timeout_ms: env_parse("NETWORK_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.network_request_timeout_ms),
            backoff,
            replica_audit_interval_ms: env_parse("REPLICA_AUDIT_INTERVAL_MS"),
            data_dir: env::var("DX_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
        }
    }

    /// Short intervals for local clusters
    pub fn development() -> Self {
        Self {
            replication_factor: 1,
            scheduler_tick_interval_ms: 100,
            operation_timeout_ms: 30_000,
            network_request_timeout_ms: 2_000,
            backoff: BackoffStrategy::Fixed { delay_ms: 200 },
            ..Self::default()
        }
    }

    /// Values suited to unit and integration tests
    pub fn test() -> Self {
        Self {
            replication_factor: 3,
            command_retry_max: 2,
            scheduler_tick_interval_ms: 10,
            scheduler_max_concurrency: 4,
            worker_pool_min: 1,
            worker_pool_max: 2,
            operation_timeout_ms: 60_000,
            network_request_timeout_ms: 500,
            backoff: BackoffStrategy::Fixed { delay_ms: 10 },
            replica_audit_interval_ms: None,
            data_dir: default_data_dir(),
        }
    }

    pub fn with_replication_factor(mut self, replication_factor: u32) -> Self {
        self.replication_factor = replication_factor;
        self
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.replication_factor == 0 {
            return Err(EngineError::Configuration(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.scheduler_tick_interval_ms == 0 {
            return Err(EngineError::Configuration(
                "scheduler_tick_interval_ms must be positive".to_string(),
            ));
        }
        if self.scheduler_max_concurrency == 0 {
            return Err(EngineError::Configuration(
                "scheduler_max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.worker_pool_min == 0 || self.worker_pool_min > self.worker_pool_max {
            return Err(EngineError::Configuration(format!(
                "invalid worker pool bounds: min={} max={}",
                self.worker_pool_min, self.worker_pool_max
            )));
        }
        if let BackoffStrategy::Exponential { multiplier, .. } = self.backoff {
            if multiplier < 1.0 {
                return Err(EngineError::Configuration(format!(
                    "backoff multiplier must be >= 1.0, got {}",
                    multiplier
                )));
            }
        }
        Ok(())
    }
}
